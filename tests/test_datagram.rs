use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchyard::server::datagram::{Datagram, DatagramError, DatagramReceiver};
use tokio::net::UdpSocket;

async fn sender() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_datagrams_reach_every_subscriber() {
    let (mut receiver, _errors) = DatagramReceiver::new(|d: Datagram| Ok(d.data.to_vec()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicUsize::new(0));

    let seen_clone = Arc::clone(&seen);
    receiver.subscribe(move |payload: &Vec<u8>| {
        seen_clone.lock().unwrap().push(payload.clone());
        Ok(())
    });
    let count_clone = Arc::clone(&count);
    receiver.subscribe(move |_payload: &Vec<u8>| {
        count_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let addr = receiver.start("127.0.0.1:0", 2048).await.unwrap();
    assert!(receiver.is_running());
    assert_eq!(receiver.local_addr(), Some(addr));

    let socket = sender().await;
    socket.send_to(b"first", addr).await.unwrap();
    socket.send_to(b"second, longer", addr).await.unwrap();

    wait_until(|| count.load(Ordering::SeqCst) == 2).await;
    let mut payloads = seen.lock().unwrap().clone();
    payloads.sort();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second, longer".to_vec()]);

    receiver.stop(true).await;
    assert!(!receiver.is_running());
    assert_eq!(receiver.in_flight(), 0);
}

#[tokio::test]
async fn test_datagram_carries_exact_length_and_peer() {
    let (mut receiver, _errors) = DatagramReceiver::new(Ok);
    let captured = Arc::new(Mutex::new(None));
    let captured_clone = Arc::clone(&captured);
    receiver.subscribe(move |d: &Datagram| {
        *captured_clone.lock().unwrap() = Some(d.clone());
        Ok(())
    });

    let addr = receiver.start("127.0.0.1:0", 1024).await.unwrap();
    let socket = sender().await;
    socket.send_to(&[7u8; 3], addr).await.unwrap();

    wait_until(|| captured.lock().unwrap().is_some()).await;
    let d = captured.lock().unwrap().take().unwrap();
    assert_eq!(&d.data[..], &[7, 7, 7]);
    assert_eq!(d.peer, socket.local_addr().unwrap());
    assert_eq!(d.local, addr);

    receiver.stop(true).await;
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() {
    let (mut receiver, mut errors) = DatagramReceiver::new(|d: Datagram| {
        String::from_utf8(d.data.to_vec()).map_err(anyhow::Error::from)
    });
    let delivered = Arc::new(AtomicUsize::new(0));

    receiver.subscribe(|_msg: &String| Err(anyhow::anyhow!("subscriber rejected")));
    receiver.subscribe(|msg: &String| {
        if msg == "boom" {
            panic!("subscriber bug");
        }
        Ok(())
    });
    let delivered_clone = Arc::clone(&delivered);
    receiver.subscribe(move |_msg: &String| {
        delivered_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let addr = receiver.start("127.0.0.1:0", 1024).await.unwrap();
    let socket = sender().await;
    socket.send_to(b"boom", addr).await.unwrap();

    wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;

    let first = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, DatagramError::Subscriber { index: 0, .. }));
    let second = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, DatagramError::SubscriberPanicked { index: 1, .. }));

    // Not UTF-8: the mapper fails and nothing is published.
    socket.send_to(&[0xff, 0xfe], addr).await.unwrap();
    let mapped = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(mapped, DatagramError::Map { .. }));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    receiver.stop(true).await;
}

#[tokio::test]
async fn test_stop_is_prompt_on_quiet_socket() {
    let (receiver, _errors) = DatagramReceiver::new(Ok);
    let mut receiver = receiver.with_receive_timeout(Duration::from_millis(50));
    receiver.subscribe(|_d: &Datagram| Ok(()));
    receiver.start("127.0.0.1:0", 512).await.unwrap();

    let started = tokio::time::Instant::now();
    receiver.stop(true).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    // Stopping twice is harmless.
    receiver.stop(true).await;
}

#[tokio::test]
async fn test_start_rejects_zero_buffer_and_double_start() {
    let (mut receiver, _errors) = DatagramReceiver::new(Ok);
    assert!(receiver.start("127.0.0.1:0", 0).await.is_err());

    receiver.start("127.0.0.1:0", 512).await.unwrap();
    assert!(receiver.start("127.0.0.1:0", 512).await.is_err());
    receiver.stop(true).await;
}
