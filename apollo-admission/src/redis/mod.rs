//! Redis connection shared by the distributed limiter.

use std::sync::Arc;
use std::time::Duration;

use fred::prelude::Builder;
use fred::prelude::ClientLike;
use fred::prelude::Config;
use fred::prelude::FromValue;
use fred::prelude::Pool;
use fred::prelude::ReconnectPolicy;
use fred::types::scripts::Script;
use url::Url;

use crate::configuration::RedisConfig;

mod error;
#[cfg(test)]
pub(crate) mod mock;

pub use self::error::Error;
pub(crate) use self::error::record;

/// A pool of Redis connections with a key namespace and a per-command timeout.
#[derive(Clone)]
pub(crate) struct RedisStorage {
    pool: Arc<Pool>,
    namespace: Option<Arc<String>>,
    timeout: Duration,
}

impl RedisStorage {
    pub(crate) async fn new(config: &RedisConfig) -> Result<Self, Error> {
        let url = preprocess_urls(&config.urls)?;
        let mut client_config = Config::from_url(url.as_str())?;

        if let Some(username) = config.username.as_ref() {
            client_config.username = Some(username.clone());
        }
        if let Some(password) = config.password.as_ref() {
            client_config.password = Some(password.clone());
        }

        Self::create_client(
            client_config,
            config.timeout,
            config.pool_size as usize,
            config.namespace.clone(),
            config.required_to_start,
        )
        .await
    }

    #[cfg(test)]
    pub(crate) async fn from_mocks(
        mocks: Arc<dyn fred::mocks::Mocks>,
        namespace: Option<String>,
    ) -> Result<Self, Error> {
        let config = Config {
            mocks: Some(mocks),
            ..Default::default()
        };

        Self::create_client(config, Duration::from_millis(500), 1, namespace, true).await
    }

    async fn create_client(
        client_config: Config,
        timeout: Duration,
        pool_size: usize,
        namespace: Option<String>,
        required_to_start: bool,
    ) -> Result<Self, Error> {
        let pool = Builder::from_config(client_config)
            .with_performance_config(|config| {
                config.default_command_timeout = timeout;
            })
            .with_connection_config(|config| {
                config.internal_command_timeout = timeout;
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 1, 2000, 5))
            .build_pool(pool_size)?;

        if required_to_start {
            pool.init().await.map_err(|error| {
                let error = Error::from(error);
                tracing::error!(%error, "could not connect to redis, which is required to start");
                error
            })?;
            tracing::trace!(namespace = ?namespace, "redis connection established");
        } else {
            // Commands fail until the background connections are up.
            let _ = pool.connect();
            tracing::trace!(namespace = ?namespace, "connecting to redis in the background");
        }

        Ok(Self {
            pool: Arc::new(pool),
            namespace: namespace.map(Arc::new),
            timeout,
        })
    }

    pub(crate) fn make_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}:{key}"),
            None => key.to_string(),
        }
    }

    /// Run `script` by SHA1 against one namespaced key, loading it first if the server lost it.
    pub(crate) async fn eval_script<R>(
        &self,
        script: &Script,
        key: &str,
        args: Vec<i64>,
    ) -> Result<R, Error>
    where
        R: FromValue,
    {
        let key = self.make_key(key);
        let client = self.pool.next();

        tracing::trace!(key = %key, sha1 = %script.sha1(), "running redis script");
        match tokio::time::timeout(
            self.timeout,
            script.evalsha_with_reload::<R, _, _>(client, vec![key], args),
        )
        .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Fold several node URLs into the single cluster URL `fred` understands.
fn preprocess_urls(urls: &[Url]) -> Result<Url, Error> {
    let Some(first) = urls.first() else {
        return Err(Error::Configuration("empty Redis URL list".to_string()));
    };
    if urls.len() == 1 {
        return Ok(first.clone());
    }

    let cluster_scheme = match first.scheme() {
        "redis" | "redis-cluster" => "redis-cluster",
        "rediss" | "rediss-cluster" => "rediss-cluster",
        scheme => {
            return Err(Error::Configuration(format!(
                "invalid Redis URL scheme for a cluster: {scheme}"
            )));
        }
    };

    let mut result = first.clone();
    result
        .set_scheme(cluster_scheme)
        .map_err(|_| Error::Configuration("could not set the cluster URL scheme".to_string()))?;

    {
        let mut query = result.query_pairs_mut();
        for url in &urls[1..] {
            let host = url.host_str().ok_or_else(|| {
                Error::Configuration(format!("missing host in Redis URL {url}"))
            })?;
            let node = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            query.append_pair("node", &node);
        }
    }

    Ok(result)
}
