//! Logic for generating the configuration JSON schema.

use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;

use super::Configuration;

/// Generate a JSON schema for the configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });

    let generator = settings.into_generator();
    generator.into_root_schema_for::<Configuration>()
}
