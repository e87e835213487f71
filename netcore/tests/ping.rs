//! End-to-end scenario 3: a ping client against a server exposing the ping connection type
//! observes a non-negative delay and the server's static and dynamic data merged into the reply.

mod common;

use std::sync::Arc;
use std::time::Duration;

use netcore::conntype::ConnTypeRegistry;
use netcore::ping::{self, PingData, PingResult};
use netcore::registry::Registry;
use netcore::server::Server;
use netcore::value::Value;

async fn ping_with_retry(
    addr: &str,
    config: &netcore::config::Config,
    registry: Arc<Registry>,
    conntypes: Arc<ConnTypeRegistry>,
    data: Option<Value>,
) -> PingResult {
    let mut last_err = None;
    for _ in 0..50 {
        match ping::ping(
            addr,
            Duration::from_secs(2),
            config,
            registry.clone(),
            conntypes.clone(),
            data.clone(),
        )
        .await
        {
            Ok(result) => return result,
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    panic!("ping never completed: {last_err:?}");
}

#[tokio::test]
async fn ping_reports_delay_and_merged_server_data() {
    let config = common::test_config(18085);
    let server = Arc::new(Server::new(config.clone()));

    let ping_data = PingData {
        static_data: Value::map([("motd", Value::String("hello from netcore".to_owned()))]),
        dynamic: Some(Arc::new(|_query: &Value, _cid: Option<u64>| {
            Value::map([("clients", Value::Uint(1))])
        })),
    };
    ping::register(&server.conntypes, config.ping.writeback, ping_data);

    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
    }

    let addr = format!("127.0.0.1:{}", config.net.server.port);
    let client_registry = Arc::new(Registry::new());
    let client_conntypes = Arc::new(ConnTypeRegistry::new());

    let result = ping_with_retry(
        &addr,
        &config,
        client_registry,
        client_conntypes,
        Some(Value::map([("tag", Value::String("probe".to_owned()))])),
    )
    .await;

    assert!(result.delay.as_secs_f64() >= 0.0);
    assert!(result.reply.get("recvtime").is_some());
    assert_eq!(
        result.reply.get("motd"),
        Some(&Value::String("hello from netcore".to_owned()))
    );
    assert_eq!(result.reply.get("clients"), Some(&Value::Uint(1)));
    assert!(result.reply.get(env!("CARGO_PKG_NAME")).is_some());
}
