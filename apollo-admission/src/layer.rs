//! Tower integration: refuse requests before they reach the wrapped service.

use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::plugin::AdmissionControl;
use crate::services::AdmissionRequest;

/// Applies [`AdmissionControl`] in front of a service.
///
/// Refused requests fail with an [`AdmissionError`](crate::AdmissionError) inside the
/// [`BoxError`]; admitted ones carry an [`Admitted`](crate::Admitted) in their extensions.
#[derive(Clone)]
pub struct AdmissionLayer {
    control: Arc<AdmissionControl>,
}

impl AdmissionLayer {
    pub fn new(control: AdmissionControl) -> Self {
        Self {
            control: Arc::new(control),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            control: self.control.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    control: Arc<AdmissionControl>,
}

impl<S> Service<AdmissionRequest> for AdmissionService<S>
where
    S: Service<AdmissionRequest> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::Response: Send,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut request: AdmissionRequest) -> Self::Future {
        let control = self.control.clone();
        // The clone has not been polled ready, keep the ready service for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if let Some(admitted) = control.evaluate(&request).await? {
                request.extensions.insert(admitted);
            }
            inner.call(request).await.map_err(Into::into)
        })
    }
}
