//! End-to-end scenario 5: a server advertising a protoversion the client doesn't understand
//! causes the client to close with reason `protoversionmismatch`, observable both as the
//! client's own state and as the `CloseConnection` frame it sends back.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use netcore::client::Client;
use netcore::conntype::ConnTypeRegistry;
use netcore::packets;
use netcore::registry::Registry;
use netcore::state::ConnState;
use netcore::value::Value;
use netcore::wire;

#[tokio::test]
async fn version_mismatch_closes_with_reason() {
    let listener = TcpListener::bind("127.0.0.1:18090").await.unwrap();

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let hello = Value::map([
            ("version", Value::String("0.1.0".to_owned())),
            ("protoversion", Value::Uint(99)),
        ]);
        let frame = wire::encode(packets::ID_HELLO, &hello, Default::default()).unwrap();
        stream.write_all(&frame).await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        wire::decode(&body).unwrap()
    });

    let config = common::test_config(18090);
    let registry = Arc::new(Registry::new());
    let conntypes = Arc::new(ConnTypeRegistry::new());

    let client = Client::connect(None, &config, registry, conntypes).await.unwrap();
    client.wait_for_close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(client.state(), ConnState::Closed);

    let frame = server_task.await.unwrap();
    assert_eq!(frame.id, packets::ID_CLOSE_CONNECTION);
    assert_eq!(
        frame.payload.get("reason"),
        Some(&Value::String(packets::REASON_PROTOVERSION_MISMATCH.to_owned()))
    );
}
