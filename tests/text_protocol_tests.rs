use std::io::Cursor;
use std::time::Duration;
use tokio::time::timeout;
use zbus::protocol::*;
use zbus::text::{forward, Request, TextError, TextReader, TextWriter};
use zbus::{Bus, BusConfig, SimTransport};

async fn read_all(input: &str) -> Result<Vec<Request>, TextError> {
    let mut reader = TextReader::new(input.as_bytes());
    let mut requests = Vec::new();
    while let Some(request) = reader.read_command().await? {
        requests.push(request);
    }
    Ok(requests)
}

async fn read_err(input: &str) -> &'static str {
    match read_all(input).await {
        Err(TextError::Protocol(reason)) => reason,
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reads_commands() {
    let requests = read_all("RST\nPKT 10 03 0102\n03\n  RST").await.unwrap();
    assert_eq!(
        requests,
        vec![
            Request::Reset,
            Request::Packet(Packet::new(0x10, &[1, 2, 3]).unwrap()),
            Request::Reset,
        ]
    );
}

#[tokio::test]
async fn test_packet_data_may_be_split_anywhere_even() {
    let requests = read_all("PKT 4F 04\tAA\r\nBB CC\x0bDD\n").await.unwrap();
    assert_eq!(
        requests,
        vec![Request::Packet(Packet::new(0x4F, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap())]
    );
}

#[tokio::test]
async fn test_lowercase_hex_is_accepted() {
    let requests = read_all("PKT 1a 02 beef").await.unwrap();
    assert_eq!(
        requests,
        vec![Request::Packet(Packet::new(0x1A, &[0xBE, 0xEF]).unwrap())]
    );
}

#[tokio::test]
async fn test_empty_input() {
    assert!(read_all("").await.unwrap().is_empty());
    assert!(read_all(" \n\n ").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_input_is_rejected() {
    assert_eq!(read_err("HELLO").await, "unknown command");
    assert_eq!(read_err("PKT 10 00").await, "invalid packet length");
    assert_eq!(read_err("PKT 10 81").await, "invalid packet length");
    assert_eq!(read_err("PKT 10 02 ABC").await, "packet data does not match its length");
    assert_eq!(read_err("PKT 10 01 ABCD").await, "packet data does not match its length");
    assert_eq!(read_err("PKT 10 01 XY").await, "invalid hex digit");
    assert_eq!(read_err("PKT 10 02 AB").await, "truncated packet");
    assert_eq!(read_err("PKT 10").await, "truncated command");
    assert_eq!(read_err("PKT +1 01 00").await, "invalid hex byte");
    assert_eq!(read_err("PKT 100 01 00").await, "invalid hex byte");
}

#[tokio::test]
async fn test_overlong_token_is_rejected() {
    let input = format!("PKT 10 80 {}", "A".repeat(300));
    assert_eq!(read_err(&input).await, "token too long");
}

#[tokio::test]
async fn test_largest_packet_roundtrips_through_text() {
    let data: Vec<u8> = (0..MAX_PACKET_SIZE as u8).collect();
    let packet = Packet::new(0x22, &data).unwrap();

    let mut writer = TextWriter::new(Vec::new());
    writer.write_event(&Event::Packet(packet.clone())).await.unwrap();
    let text = String::from_utf8(writer.into_inner()).unwrap();

    assert_eq!(read_all(&text).await.unwrap(), vec![Request::Packet(packet)]);
}

#[tokio::test]
async fn test_writer_session() {
    let mut writer = TextWriter::new(Vec::new());
    writer.write_greeting("0.1.0").await.unwrap();
    writer
        .write_event(&Event::Connect {
            addr: 0x10,
            device: Device::new(Udid([1, 2, 3, 4, 5, 6, 7, 8])),
        })
        .await
        .unwrap();
    writer
        .write_event(&Event::Packet(Packet::new(0x10, &[0x0F, 0xA0]).unwrap()))
        .await
        .unwrap();
    writer.write_event(&Event::error(ErrorKind::System)).await.unwrap();
    writer.write_event(&Event::error_at(ErrorKind::Ack, 0x10)).await.unwrap();
    writer.write_event(&Event::Disconnect { addr: 0x10 }).await.unwrap();
    writer.write_event(&Event::Reset).await.unwrap();

    let text = String::from_utf8(writer.into_inner()).unwrap();
    assert_eq!(
        text,
        "ZBUS 0.1.0\nCONN 10\nPKT 10 02\n0FA0\nERR 10\nDISC 10\nRST\n"
    );
}

#[tokio::test]
async fn test_forwarding_survives_a_slow_event_reader() {
    let config = BusConfig::default();
    let (transport, alert) = SimTransport::bind("127.0.0.1:0", config.sim.clone())
        .await
        .unwrap();
    let mut bus = Bus::new(Box::new(transport), Box::new(alert), config.clone()).unwrap();

    // nobody is on the bus, so every command comes back as an error event
    let total = 100 * (config.event_capacity + config.command_capacity);
    let input = "PKT 30 01 00\n".repeat(total);
    let forwarder = tokio::spawn(forward(Cursor::new(input.into_bytes()), bus.handle()));

    // let both queues fill up before reading anything
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!forwarder.is_finished());

    for _ in 0..total {
        let event = timeout(Duration::from_secs(5), bus.next_event())
            .await
            .expect("bus stalled")
            .unwrap();
        assert_eq!(event, Event::error_at(ErrorKind::Ack, 0x30));
    }
    forwarder.await.unwrap().unwrap();
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_forwarding_stops_on_bad_input() {
    let config = BusConfig::default();
    let (transport, alert) = SimTransport::bind("127.0.0.1:0", config.sim.clone())
        .await
        .unwrap();
    let mut bus = Bus::new(Box::new(transport), Box::new(alert), config).unwrap();

    let result = forward(Cursor::new(b"RST\nBOGUS\n".to_vec()), bus.handle()).await;
    assert!(matches!(result, Err(TextError::Protocol("unknown command"))));
    assert_eq!(bus.next_event().await, Some(Event::Reset));

    bus.close().await.unwrap();
    let result = forward(Cursor::new(b"RST\n".to_vec()), bus.handle()).await;
    assert!(matches!(result, Err(TextError::Bus(zbus::BusError::Closed))));
}
