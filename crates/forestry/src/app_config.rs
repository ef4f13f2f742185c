//! 🔧 App Configuration: TOML and env vars in, a ready-to-use struct out.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment. Env vars use the `FORESTRY_` prefix and `__` as the
//! table separator, so `FORESTRY_CONNECTION__HOST=db1` lands in `connection.host`
//! and `FORESTRY_WRITE_BATCHER__BATCH_SIZE=500` lands where you'd hope.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::clients::Connection;
use crate::datamovement::{QueryBatcherConfig, WriteBatcherConfig};
use crate::dataservices::DataServicesConfig;

/// 📦 One struct to rule them all: where the cluster is, and how hard to push it.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🔌 The only table without a default. We can't guess your hostname. We tried.
    pub connection: Connection,
    #[serde(default)]
    pub write_batcher: WriteBatcherConfig,
    #[serde(default)]
    pub query_batcher: QueryBatcherConfig,
    #[serde(default)]
    pub data_services: DataServicesConfig,
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// 📐 The rules:
///   - `None` → env vars only.
///   - `Some(path)` → env vars and the TOML file, merged. TOML wins on conflicts.
///
/// 💀 Errors carry the file name (if any) so the 3am reader knows where to look.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("FORESTRY_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (FORESTRY_*). \
             The file exists in our hearts, but apparently not in a shape serde likes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (FORESTRY_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::clients::AuthKind;

    fn write_test_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 no temp file. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 the temp file refused our TOML");
        file
    }

    #[test]
    fn the_one_where_every_table_shows_up_and_is_heard() {
        let file = write_test_config(
            r#"
            [connection]
            host = "db1.example.com"
            port = 8010
            username = "admin"
            password = "hunter2"
            auth = "basic"
            database = "Documents"

            [write_batcher]
            batch_size = 100
            thread_count = 8

            [query_batcher]
            batch_size = 500

            [data_services]
            batch_size = 50
            thread_count = 3
            "#,
        );

        let config = load_config(Some(file.path())).expect("💀 a perfectly good config was refused");

        assert_eq!(config.connection.host, "db1.example.com");
        assert_eq!(config.connection.port, 8010);
        assert_eq!(config.connection.auth, AuthKind::Basic);
        assert_eq!(config.connection.database.as_deref(), Some("Documents"));
        assert_eq!(config.write_batcher.batch_size, 100);
        assert_eq!(config.write_batcher.thread_count, Some(8));
        assert_eq!(config.query_batcher.batch_size, 500);
        assert_eq!(config.data_services.batch_size, 50);
        assert_eq!(config.data_services.thread_count, Some(3));
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let file = write_test_config(
            r#"
            [connection]
            host = "localhost"
            "#,
        );

        let config: AppConfig = Figment::new()
            .merge(Toml::file(file.path()))
            .extract()
            .expect("💀 defaults should fill the gaps. Serde left us on read otherwise.");

        assert_eq!(config.connection.port, 8000);
        assert_eq!(config.connection.scheme, "http");
        assert_eq!(config.connection.auth, AuthKind::Digest);
        assert_eq!(config.connection.rest_base_path, "/LATEST");
        assert_eq!(config.connection.database, None);
        assert_eq!(config.write_batcher, WriteBatcherConfig::default());
        assert_eq!(config.write_batcher.batch_size, 250);
        assert_eq!(config.query_batcher.batch_size, 1000);
        assert_eq!(config.data_services, DataServicesConfig::default());
    }

    #[test]
    fn the_one_where_a_bad_auth_kind_names_the_file_in_the_error() {
        let file = write_test_config(
            r#"
            [connection]
            host = "localhost"
            auth = "vibes"
            "#,
        );

        let err = load_config(Some(file.path())).expect_err("💀 'vibes' is not an auth scheme");
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }
}
