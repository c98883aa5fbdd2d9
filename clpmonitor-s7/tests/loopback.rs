//! Integration tests for the S7 client.
//!
//! These tests drive the real TCP transport against the simulated
//! controller served on a loopback listener.

use std::net::SocketAddr;
use std::time::Duration;

use clpmonitor_s7::{
    Connector, Endpoint, PlcError, SimulatedPlc, TagAddress, TagDescriptor, TagValue, TagWrite,
    TpktCodec, pdu,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Helper to serve `plc` on an ephemeral loopback port.
async fn spawn_plc(plc: SimulatedPlc) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(plc.serve(listener));
    addr
}

fn connector(addr: SocketAddr) -> Connector {
    Connector::new(
        Endpoint::new(addr.ip().to_string(), addr.port()).with_timeout(Duration::from_millis(500)),
    )
}

/// DB9 with a colour pattern 0..=6 repeated over bytes 68..96.
fn stock_block() -> Vec<u8> {
    let mut data = vec![0u8; 96];
    for (i, b) in data[68..].iter_mut().enumerate() {
        *b = (i % 7) as u8;
    }
    data
}

#[tokio::test]
async fn test_read_stock_block_over_tcp() {
    let addr = spawn_plc(SimulatedPlc::new().with_block(9, stock_block())).await;

    let mut client = connector(addr).connect().await.unwrap();
    let colours = client.read_block(9, 68, 28).await.unwrap();
    client.disconnect().await;

    assert_eq!(colours.len(), 28);
    assert_eq!(colours[..8], [0, 1, 2, 3, 4, 5, 6, 0]);
}

#[tokio::test]
async fn test_bit_write_isolated_over_tcp() {
    let plc = SimulatedPlc::new().with_block(9, vec![0b0101_0001; 8]);
    let addr = spawn_plc(plc.clone()).await;
    let mut client = connector(addr).connect().await.unwrap();

    client.write_bit(9, 2, 3, true).await.unwrap();

    let block = plc.block(9).unwrap();
    assert_eq!(block[2], 0b0101_1001);
    assert_eq!(block[1], 0b0101_0001);
    assert_eq!(block[3], 0b0101_0001);
    assert!(client.read_bit(9, 2, 3).await.unwrap());
}

#[tokio::test]
async fn test_string_roundtrip_over_tcp() {
    let addr = spawn_plc(SimulatedPlc::new().with_block(12, vec![0; 64])).await;
    let mut client = connector(addr).connect().await.unwrap();

    client.write_string(12, 0, 20, "OP-2024-0042").await.unwrap();
    assert_eq!(client.read_string(12, 0, 20).await.unwrap(), "OP-2024-0042");

    let value = client
        .read_tag(&TagAddress::string(12, 0, 20).unwrap())
        .await
        .unwrap();
    assert_eq!(value, TagValue::String("OP-2024-0042".into()));
}

#[tokio::test]
async fn test_chunked_read_over_tcp() {
    let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
    let plc = SimulatedPlc::new().with_block(20, data.clone());
    plc.set_pdu_size(120);
    let addr = spawn_plc(plc.clone()).await;
    let mut client = connector(addr).connect().await.unwrap();
    assert_eq!(client.pdu_size(), 120);

    assert_eq!(client.read_block(20, 10, 1000).await.unwrap(), data[10..1010]);

    let patch = vec![0xEE; client.max_write_len()];
    client.write_block(20, 10, &patch).await.unwrap();
    assert_eq!(client.read_block(20, 10, patch.len()).await.unwrap(), patch);
}

#[tokio::test]
async fn test_oversized_write_sends_nothing_over_tcp() {
    let plc = SimulatedPlc::new().with_block(9, vec![0; 600]);
    let addr = spawn_plc(plc.clone()).await;
    let mut client = connector(addr).connect().await.unwrap();

    let err = client.write_block(9, 0, &[0xAA; 700]).await.unwrap_err();

    assert!(matches!(err, PlcError::Address(_)));
    assert_eq!(plc.block(9).unwrap(), vec![0; 600]);
    assert_eq!(plc.write_count(), 0);
}

#[tokio::test]
async fn test_raw_frames_through_codec() {
    let addr = spawn_plc(SimulatedPlc::new()).await;
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, TpktCodec::new());

    let request = pdu::connection_request(0, 1);
    framed.send(request.as_slice()).await.unwrap();
    let confirm = framed.next().await.unwrap().unwrap();
    assert!(pdu::check_connection_confirm(&confirm).is_ok());

    let request = pdu::setup_request(1, 480);
    framed.send(request.as_slice()).await.unwrap();
    let setup = framed.next().await.unwrap().unwrap();
    assert_eq!(pdu::parse_setup_response(&setup).unwrap(), 480);
}

#[tokio::test]
async fn test_offline_controller_is_connection_error() {
    let plc = SimulatedPlc::new().with_block(9, stock_block());
    plc.set_offline(true);
    let addr = spawn_plc(plc.clone()).await;

    let err = connector(addr).connect().await.unwrap_err();
    assert!(matches!(err, PlcError::Connection(_)), "got {err}");
}

#[tokio::test]
async fn test_nothing_listening_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = connector(addr).connect().await.unwrap_err();
    assert!(matches!(err, PlcError::Connection(_)));
}

#[tokio::test]
async fn test_controller_drops_mid_session() {
    let plc = SimulatedPlc::new().with_block(9, stock_block());
    let addr = spawn_plc(plc.clone()).await;
    let mut client = connector(addr).connect().await.unwrap();

    plc.set_offline(true);
    let err = client.read_block(9, 68, 28).await.unwrap_err();
    assert!(matches!(err, PlcError::Connection(_)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_tag_write_over_tcp() {
    let plc = SimulatedPlc::new().with_block(9, stock_block());
    let addr = spawn_plc(plc.clone()).await;

    let write = TagWrite::prepare(&TagDescriptor::new(9, 68, "BYTE"), "5").unwrap();
    write.execute(&connector(addr)).await.unwrap();

    assert_eq!(plc.block(9).unwrap()[68], 5);
}
