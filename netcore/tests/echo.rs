//! End-to-end scenarios 2 and 4: an application packet registered on both ends round-trips a
//! payload through a real socket, first small and then large enough to cross the compression
//! threshold.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netcore::conntype::ConnTypeRegistry;
use netcore::handler::{DynHandler, Gate, PacketHandler, SmartHandler};
use netcore::registry::Registry;
use netcore::server::Server;
use netcore::state::ConnState;
use netcore::value::Value;
use tokio::sync::mpsc;

/// Server-side handler: sends whatever it receives straight back to the same connection.
struct Echo {
    server: Arc<Server>,
    id: Arc<AtomicU32>,
}

impl PacketHandler for Echo {
    fn receive(&self, msg: &Value, cid: Option<u64>) {
        let id = self.id.load(Ordering::Relaxed);
        if let Some(cid) = cid {
            let _ = self.server.send_message(cid, id, msg);
        }
    }

    fn send(&self, _msg: &Value, _cid: Option<u64>) {}
}

/// Client-side handler: records every payload it receives onto a channel the test awaits on.
struct Record(mpsc::UnboundedSender<Value>);

impl PacketHandler for Record {
    fn receive(&self, msg: &Value, _cid: Option<u64>) {
        let _ = self.0.send(msg.clone());
    }

    fn send(&self, _msg: &Value, _cid: Option<u64>) {}
}

fn register_echo(server: &Arc<Server>) -> u32 {
    let id_cell = Arc::new(AtomicU32::new(0));
    let handler: Arc<DynHandler> = Arc::new(SmartHandler::new(
        Echo {
            server: server.clone(),
            id: id_cell.clone(),
        },
        Gate::default().with_state(ConnState::Active),
    ));
    let id = server.registry.register("echo:echo", handler, None).unwrap();
    id_cell.store(id, Ordering::Relaxed);
    id
}

fn register_record(registry: &Registry) -> (u32, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<DynHandler> = Arc::new(SmartHandler::new(
        Record(tx),
        Gate::default().with_state(ConnState::Active),
    ));
    let id = registry.register("echo:echo", handler, None).unwrap();
    (id, rx)
}

#[tokio::test]
async fn echo_roundtrips_small_payload() {
    let config = common::test_config(18081);
    let server = Arc::new(Server::new(config.clone()));
    let echo_id = register_echo(&server);
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
    }

    let client_registry = Arc::new(Registry::new());
    let (client_id, mut rx) = register_record(&client_registry);
    assert_eq!(client_id, echo_id, "fresh registries allocate ids deterministically");

    let conntypes = Arc::new(ConnTypeRegistry::new());
    let client = common::connect_with_retry(&config, client_registry, conntypes).await;
    client.wait_for_connection(Duration::from_secs(5)).await.unwrap();

    client
        .send_message(echo_id, &Value::String("hello".to_owned()))
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for echo")
        .expect("channel closed before a reply arrived");
    assert_eq!(received, Value::String("hello".to_owned()));
}

#[tokio::test]
async fn echo_roundtrips_payload_over_the_compression_threshold() {
    let config = common::test_config(18082);
    let server = Arc::new(Server::new(config.clone()));
    let echo_id = register_echo(&server);
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
    }

    let client_registry = Arc::new(Registry::new());
    let (client_id, mut rx) = register_record(&client_registry);
    assert_eq!(client_id, echo_id);

    let conntypes = Arc::new(ConnTypeRegistry::new());
    let client = common::connect_with_retry(&config, client_registry, conntypes).await;
    client.wait_for_connection(Duration::from_secs(5)).await.unwrap();

    let payload = Value::String("x".repeat(16 * 1024));
    client.send_message(echo_id, &payload).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for echo")
        .expect("channel closed before a reply arrived");
    assert_eq!(received, payload);
}
