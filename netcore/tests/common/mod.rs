//! Shared scaffolding for the end-to-end tests: a bindable `Config` and a connect loop that
//! tolerates the small window between `Server::run` being spawned and its listener actually
//! binding.

use std::sync::Arc;
use std::time::Duration;

use netcore::client::Client;
use netcore::config::Config;
use netcore::conntype::ConnTypeRegistry;
use netcore::registry::Registry;

#[allow(dead_code)]
pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.net.server.host = "127.0.0.1".to_owned();
    config.net.server.port = port;
    config.net.client.host = "127.0.0.1".to_owned();
    config.net.client.port = port;
    config
}

#[allow(dead_code)]
pub async fn connect_with_retry(
    config: &Config,
    registry: Arc<Registry>,
    conntypes: Arc<ConnTypeRegistry>,
) -> Arc<Client> {
    let mut last_err = None;
    for _ in 0..50 {
        match Client::connect(None, config, registry.clone(), conntypes.clone()).await {
            Ok(client) => return client,
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    panic!("failed to connect to test server after retries: {last_err:?}");
}
