//! Reference counting and two-phase close.

use sockmgr::{
    AddressFamily, CancelFlags, EventQueue, ReadySet, SocketError, SocketManager, SocketType,
    SubmitFlags, TaskRef,
};
use std::time::Duration;

#[test]
fn test_close_is_deferred_to_dispatch() {
    let mut manager = SocketManager::new().unwrap();
    let a = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    manager.detach(a).unwrap();

    assert_eq!(manager.len(), 0);
    assert_eq!(manager.close_pending(), 1);
    assert_eq!(manager.raw_fd(a), Err(SocketError::InvalidSocket));

    // The tombstone keeps its slot until the next dispatch pass.
    let b = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    assert_ne!(b.slot(), a.slot());

    manager.dispatch(&ReadySet::default());
    assert_eq!(manager.close_pending(), 0);

    let c = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    assert_eq!(c.slot(), a.slot());
    assert_ne!(c, a);
    assert_eq!(manager.detach(a), Err(SocketError::InvalidSocket));
    assert_eq!(manager.references(c).unwrap(), 1);
}

#[test]
fn test_attach_and_detach() {
    let mut manager = SocketManager::new().unwrap();
    let id = manager
        .create(AddressFamily::Inet6, SocketType::Stream)
        .unwrap();

    assert_eq!(manager.attach(id).unwrap(), id);
    assert_eq!(manager.references(id).unwrap(), 2);

    manager.detach(id).unwrap();
    assert_eq!(manager.references(id).unwrap(), 1);
    manager.detach(id).unwrap();
    assert!(manager.is_empty());
}

#[test]
fn test_queued_event_holds_socket() {
    let mut manager = SocketManager::new().unwrap();
    let queue = EventQueue::new();
    let task: TaskRef = queue.clone();

    let id = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    manager
        .bind(id, &any.into(), sockmgr::BindOptions::empty())
        .unwrap();
    manager
        .recv_region(id, vec![0; 16], 1, &task, SubmitFlags::empty())
        .unwrap();

    // The caller lets go; the queued receive keeps the socket open.
    manager.detach(id).unwrap();
    assert_eq!(manager.references(id).unwrap(), 1);
    assert_eq!(manager.close_pending(), 0);

    manager.cancel(id, None, CancelFlags::ALL).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(manager.references(id), Err(SocketError::InvalidSocket));
    assert_eq!(manager.close_pending(), 1);

    manager.run_once(Some(Duration::from_millis(1))).unwrap();
    assert_eq!(manager.close_pending(), 0);
}

#[test]
fn test_stale_readiness_is_ignored() {
    let mut manager = SocketManager::new().unwrap();
    let queue = EventQueue::new();
    let task: TaskRef = queue.clone();

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let id = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    manager
        .bind(id, &any.into(), sockmgr::BindOptions::empty())
        .unwrap();
    let addr = manager.local_addr(id).unwrap().as_socket().unwrap();
    manager
        .recv_region(id, vec![0; 16], 1, &task, SubmitFlags::empty())
        .unwrap();

    sender.send_to(b"late", addr).unwrap();
    let ready = manager.wait(Some(Duration::from_secs(1))).unwrap();
    assert!(ready.is_readable(id));

    // Closed between wait and dispatch: the entry must be skipped.
    manager.cancel(id, None, CancelFlags::ALL).unwrap();
    manager.detach(id).unwrap();
    queue.drain();

    manager.dispatch(&ready);
    assert!(queue.is_empty());
    assert!(manager.is_empty());
    assert_eq!(manager.close_pending(), 0);
}

#[test]
fn test_invalid_ids() {
    let mut manager = SocketManager::new().unwrap();
    let queue = EventQueue::new();
    let task: TaskRef = queue.clone();
    let id = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    manager.detach(id).unwrap();
    manager.dispatch(&ReadySet::default());

    assert!(matches!(
        manager.recv_region(id, vec![0; 4], 1, &task, SubmitFlags::empty()),
        Err(SocketError::InvalidSocket)
    ));
    assert_eq!(
        manager.cancel(id, None, CancelFlags::ALL),
        Err(SocketError::InvalidSocket)
    );
    assert_eq!(manager.attach(id), Err(SocketError::InvalidSocket));
}

#[test]
fn test_max_fd_tracks_live_sockets() {
    let mut manager = SocketManager::new().unwrap();
    assert_eq!(manager.max_fd(), None);

    let a = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    let b = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    let (fa, fb) = (manager.raw_fd(a).unwrap(), manager.raw_fd(b).unwrap());
    assert_eq!(manager.max_fd(), Some(fa.max(fb)));

    let (high, low) = if fa > fb { (a, fb) } else { (b, fa) };
    manager.detach(high).unwrap();
    assert_eq!(manager.max_fd(), Some(low));
}
