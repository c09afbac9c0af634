use std::borrow::Cow;

use comms::{
    Deserialize, Serialize,
    msg::{Command, Msg, Payload},
};
use tokio::io;

struct MyStr<'a>(&'a str);

impl<'a> Serialize<'a> for MyStr<'_> {
    fn serialize(&'a self, _buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        Some(self.0.as_bytes())
    }
}

impl<'a> Deserialize<'a> for MyStr<'a> {
    fn deserialize(buf: &'a mut [u8]) -> std::io::Result<Self> {
        let s = std::str::from_utf8(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self(s))
    }
}

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let msg = MyStr("Hello, world!");

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::framed(rx, tx);

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::framed(rx, tx);

    let mut buf: Vec<u64> = Vec::new();
    let s: MyStr = rx.recv_into(&mut buf).await.unwrap();

    assert_eq!(msg.0, s.0);
}

#[tokio::test]
async fn reduce_round_trip_over_duplex() {
    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::framed(rx, tx);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::framed(rx, tx);

    let keys = vec!["loss/count".to_string(), "loss/total".to_string()];
    let values = [4.0, 10.5];

    tx.send(&Msg::Control(Command::Reduce {
        round: 0,
        keys: keys.clone(),
    }))
    .await
    .unwrap();
    tx.send(&Msg::Data(Payload::Values(&values))).await.unwrap();
    tx.send(&Msg::Err(Cow::Borrowed("rank 1 diverged")))
        .await
        .unwrap();

    let mut buf: Vec<u64> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Reduce { round, keys: got }) => {
            assert_eq!(round, 0);
            assert_eq!(got, keys);
        }
        other => panic!("unexpected msg: {other:?}"),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Values(got)) => assert_eq!(got, &values),
        other => panic!("unexpected msg: {other:?}"),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Err(reason) => assert_eq!(reason, "rank 1 diverged"),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn closed_stream_is_an_error() {
    let (one, two) = io::duplex(64);
    drop(one);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::framed(rx, tx);

    let mut buf: Vec<u64> = Vec::new();
    let res: std::io::Result<Msg> = rx.recv_into(&mut buf).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    use tokio::io::AsyncWriteExt;

    let (mut one, two) = io::duplex(64);
    let len = (comms::MAX_FRAME_LEN as u64 + 1).to_be_bytes();
    one.write_all(&len).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::framed(rx, tx);

    let mut buf: Vec<u64> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
