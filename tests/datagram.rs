//! Datagram socket tests.

use sockmgr::{
    AddressFamily, Attributes, BindOptions, Buffer, BufferList, CancelFlags, EventQueue,
    SendMeta, SockAddr, SocketError, SocketEvent, SocketId, SocketManager, SocketType,
    Submission, SubmitFlags, TaskRef,
};
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Run the reactor until `count` events have been delivered, or timeout.
fn poll_events(
    manager: &mut SocketManager,
    queue: &EventQueue,
    count: usize,
    timeout: Duration,
) -> Vec<SocketEvent> {
    let start = Instant::now();
    let mut events = queue.drain();
    while events.len() < count && start.elapsed() < timeout {
        manager.run_once(Some(Duration::from_millis(10))).unwrap();
        events.extend(queue.drain());
    }
    events
}

fn bound_udp(manager: &mut SocketManager) -> (SocketId, SocketAddr) {
    let id = manager
        .create(AddressFamily::Inet, SocketType::Datagram)
        .unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    manager.bind(id, &any.into(), BindOptions::empty()).unwrap();
    let addr = manager.local_addr(id).unwrap().as_socket().unwrap();
    (id, addr)
}

fn task() -> (Rc<EventQueue>, TaskRef) {
    let queue = EventQueue::new();
    let task: TaskRef = queue.clone();
    (queue, task)
}

#[test]
fn test_queued_recv_scatters_datagram() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (server, server_addr) = bound_udp(&mut manager);

    let buffers: BufferList = vec![
        Buffer::with_capacity(16),
        Buffer::with_capacity(16),
        Buffer::with_capacity(16),
    ]
    .into();
    let submission = manager
        .recv(server, buffers, 0, &task, SubmitFlags::empty())
        .unwrap();
    assert!(submission.is_in_progress());
    assert_eq!(manager.references(server).unwrap(), 2);
    assert_eq!(manager.queued(server).unwrap(), (1, 0));
    assert_eq!(manager.interest(server).unwrap(), (true, false));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let payload: Vec<u8> = (0..37u8).collect();
    client.send_to(&payload, server_addr).unwrap();

    let events = poll_events(&mut manager, &queue, 1, Duration::from_secs(1));
    assert_eq!(events.len(), 1);
    let SocketEvent::Recv(ev) = events.into_iter().next().unwrap() else {
        panic!("expected a recv event");
    };

    assert_eq!(ev.result(), Ok(()));
    assert_eq!(ev.n(), 37);
    assert_eq!(ev.minimum(), 1);
    assert_eq!(
        ev.address().and_then(SockAddr::as_socket),
        Some(client.local_addr().unwrap())
    );
    assert!(ev.metadata().attributes.contains(Attributes::TIMESTAMP));
    assert!(!ev.metadata().is_truncated());

    let list = ev.payload().as_list().unwrap();
    let used: Vec<usize> = list.iter().map(Buffer::used_len).collect();
    assert_eq!(used, vec![16, 16, 5]);
    assert_eq!(ev.data(), payload);

    assert_eq!(manager.references(server).unwrap(), 1);
    assert_eq!(manager.queued(server).unwrap(), (0, 0));
}

#[test]
fn test_datagram_between_managed_sockets() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (a, a_addr) = bound_udp(&mut manager);
    let (b, b_addr) = bound_udp(&mut manager);

    manager
        .recv(
            b,
            BufferList::single(Buffer::with_capacity(512)),
            1,
            &task,
            SubmitFlags::empty(),
        )
        .unwrap();

    let payload = vec![0xa5u8; 37];
    manager
        .send_region(a, payload.clone(), &SendMeta::new(b_addr.into()), &task, SubmitFlags::IMMEDIATE)
        .unwrap();

    let events = poll_events(&mut manager, &queue, 1, Duration::from_secs(1));
    let ev = events.into_iter().next().unwrap().into_io().unwrap();
    assert_eq!(ev.socket(), b);
    assert_eq!(ev.result(), Ok(()));
    assert_eq!(ev.n(), 37);
    assert_eq!(ev.address().and_then(SockAddr::as_socket), Some(a_addr));
    assert_eq!(ev.data(), payload);
}

#[test]
fn test_truncated_datagram() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (server, server_addr) = bound_udp(&mut manager);

    manager
        .recv_region(server, vec![0; 8], 1, &task, SubmitFlags::empty())
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(&[7u8; 20], server_addr).unwrap();

    let events = poll_events(&mut manager, &queue, 1, Duration::from_secs(1));
    let ev = events.into_iter().next().unwrap().into_io().unwrap();
    assert_eq!(ev.result(), Ok(()));
    assert_eq!(ev.n(), 8);
    assert!(ev.metadata().is_truncated());
    assert_eq!(ev.data(), vec![7u8; 8]);
}

#[test]
fn test_immediate_recv() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (server, server_addr) = bound_udp(&mut manager);

    // Nothing waiting: the request is queued even in immediate mode.
    let submission = manager
        .recv_region(server, vec![0; 64], 1, &task, SubmitFlags::IMMEDIATE)
        .unwrap();
    assert!(submission.is_in_progress());
    manager.cancel(server, None, CancelFlags::RECV).unwrap();
    let canceled = queue.drain();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].result(), Err(SocketError::Canceled));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hello", server_addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    match manager
        .recv_region(server, vec![0; 64], 1, &task, SubmitFlags::IMMEDIATE)
        .unwrap()
    {
        Submission::Done(ev) => {
            assert_eq!(ev.n(), 5);
            assert_eq!(ev.data(), b"hello");
        }
        other => panic!("expected immediate completion, got {:?}", other),
    }
    assert!(queue.is_empty());
}

#[test]
fn test_send_to_between_sockets() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (a, _) = bound_udp(&mut manager);
    let (b, b_addr) = bound_udp(&mut manager);

    manager
        .recv(
            b,
            BufferList::single(Buffer::with_capacity(512)),
            1,
            &task,
            SubmitFlags::empty(),
        )
        .unwrap();

    let meta = SendMeta::new(b_addr.into());
    let submission = manager
        .send_to(
            a,
            BufferList::single(Buffer::from_slice(b"ping")),
            &meta,
            &task,
            SubmitFlags::empty(),
        )
        .unwrap();
    assert!(matches!(submission, Submission::Delivered));

    let events = poll_events(&mut manager, &queue, 2, Duration::from_secs(1));
    assert_eq!(events.len(), 2);

    let send = events
        .iter()
        .find(|e| matches!(e, SocketEvent::Send(_)))
        .unwrap();
    assert_eq!(send.socket(), a);
    assert_eq!(send.result(), Ok(()));

    let recv = events
        .into_iter()
        .find_map(|e| match e {
            SocketEvent::Recv(ev) => Some(ev),
            _ => None,
        })
        .unwrap();
    assert_eq!(recv.socket(), b);
    assert_eq!(recv.data(), b"ping");
}

#[test]
fn test_connected_datagram_send() {
    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let (a, _) = bound_udp(&mut manager);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();
    manager.connect(a, &peer_addr.into(), &task).unwrap();

    let connect = queue.pop().unwrap();
    assert!(matches!(connect, SocketEvent::Connect(_)));
    assert_eq!(connect.result(), Ok(()));
    assert_eq!(
        manager.peer_addr(a).unwrap().as_socket(),
        Some(peer_addr)
    );

    match manager
        .send_region(a, b"pong".to_vec(), &SendMeta::default(), &task, SubmitFlags::IMMEDIATE)
        .unwrap()
    {
        Submission::Done(ev) => {
            assert_eq!(ev.result(), Ok(()));
            assert_eq!(ev.n(), 4);
        }
        other => panic!("expected immediate completion, got {:?}", other),
    }

    let mut buf = [0u8; 16];
    peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[test]
fn test_send_family_mismatch() {
    let mut manager = SocketManager::new().unwrap();
    let (_queue, task) = task();
    let (a, _) = bound_udp(&mut manager);

    let v6: SocketAddr = "[::1]:9".parse().unwrap();
    let result = manager.send_to(
        a,
        BufferList::single(Buffer::from_slice(b"x")),
        &SendMeta::new(v6.into()),
        &task,
        SubmitFlags::empty(),
    );
    assert!(matches!(result, Err(SocketError::FamilyMismatch)));
}

#[test]
fn test_cancel_by_owner() {
    let mut manager = SocketManager::new().unwrap();
    let (queue_a, task_a) = task();
    let (queue_b, task_b) = task();
    let (server, _) = bound_udp(&mut manager);

    for task in [&task_a, &task_b, &task_a] {
        manager
            .recv_region(server, vec![0; 32], 1, task, SubmitFlags::empty())
            .unwrap();
    }
    assert_eq!(manager.references(server).unwrap(), 4);

    manager
        .cancel(server, Some(&task_a), CancelFlags::RECV)
        .unwrap();
    let canceled = queue_a.drain();
    assert_eq!(canceled.len(), 2);
    assert!(
        canceled
            .iter()
            .all(|e| e.result() == Err(SocketError::Canceled))
    );
    assert!(queue_b.is_empty());
    assert_eq!(manager.queued(server).unwrap(), (1, 0));
    assert_eq!(manager.references(server).unwrap(), 2);
    assert_eq!(manager.interest(server).unwrap(), (true, false));

    manager.cancel(server, None, CancelFlags::ALL).unwrap();
    assert_eq!(queue_b.drain().len(), 1);
    assert_eq!(manager.queued(server).unwrap(), (0, 0));
    assert_eq!(manager.references(server).unwrap(), 1);
    assert_eq!(manager.interest(server).unwrap(), (false, false));
}

#[test]
fn test_unix_datagram() {
    use std::os::unix::net::UnixDatagram;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sockmgr.sock");

    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();
    let id = manager
        .create(AddressFamily::Unix, SocketType::Datagram)
        .unwrap();
    let addr = SockAddr::unix(&path).unwrap();
    manager.bind(id, &addr, BindOptions::empty()).unwrap();
    assert!(manager.is_bound(id).unwrap());

    manager
        .recv_region(id, vec![0; 64], 1, &task, SubmitFlags::empty())
        .unwrap();

    let client = UnixDatagram::unbound().unwrap();
    client.send_to(b"local", &path).unwrap();

    let events = poll_events(&mut manager, &queue, 1, Duration::from_secs(1));
    let ev = events.into_iter().next().unwrap().into_io().unwrap();
    assert_eq!(ev.result(), Ok(()));
    assert_eq!(ev.data(), b"local");
}

fn socket_tos(fd: std::os::unix::io::RawFd) -> libc::c_int {
    let mut tos: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &mut tos as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    assert_eq!(rc, 0);
    tos
}

#[test]
fn test_per_packet_dscp_is_received() {
    let mut manager = SocketManager::builder().receive_dscp(true).build().unwrap();
    let (queue, task) = task();
    let (a, _) = bound_udp(&mut manager);
    let (b, b_addr) = bound_udp(&mut manager);

    manager
        .recv_region(b, vec![0; 64], 1, &task, SubmitFlags::empty())
        .unwrap();

    let meta = SendMeta::new(b_addr.into()).with_dscp(46);
    manager
        .send_region(a, b"marked".to_vec(), &meta, &task, SubmitFlags::IMMEDIATE)
        .unwrap();

    // Marked per packet: the socket's own TOS is untouched.
    assert_eq!(socket_tos(manager.raw_fd(a).unwrap()), 0);

    let events = poll_events(&mut manager, &queue, 1, Duration::from_secs(1));
    let ev = events.into_iter().next().unwrap().into_io().unwrap();
    assert_eq!(ev.result(), Ok(()));
    assert!(ev.metadata().attributes.contains(Attributes::DSCP));
    assert_eq!(ev.metadata().dscp, 46);
}

#[test]
fn test_per_socket_dscp_shadow() {
    let mut manager = SocketManager::builder().packet_dscp(false).build().unwrap();
    let (_queue, task) = task();
    let (a, _) = bound_udp(&mut manager);
    let (_, b_addr) = bound_udp(&mut manager);
    let fd = manager.raw_fd(a).unwrap();

    let meta = SendMeta::new(b_addr.into()).with_dscp(10);
    manager
        .send_region(a, b"one".to_vec(), &meta, &task, SubmitFlags::IMMEDIATE)
        .unwrap();
    assert_eq!(socket_tos(fd), 10 << 2);

    // Reset behind the manager's back: an unchanged code point is not
    // applied again.
    let zero: libc::c_int = 0;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &zero as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
    manager
        .send_region(a, b"two".to_vec(), &meta, &task, SubmitFlags::IMMEDIATE)
        .unwrap();
    assert_eq!(socket_tos(fd), 0);

    let changed = SendMeta::new(b_addr.into()).with_dscp(12);
    manager
        .send_region(a, b"three".to_vec(), &changed, &task, SubmitFlags::IMMEDIATE)
        .unwrap();
    assert_eq!(socket_tos(fd), 12 << 2);
}

#[test]
fn test_cancel_by_owner_keeps_order() {
    let mut manager = SocketManager::new().unwrap();
    let (queue_a, task_a) = task();
    let (queue_b, task_b) = task();
    let (server, _) = bound_udp(&mut manager);

    let submissions = [
        (&task_b, 10),
        (&task_a, 11),
        (&task_b, 12),
        (&task_a, 13),
        (&task_b, 14),
    ];
    for (task, size) in submissions {
        manager
            .recv_region(server, vec![0; size], 1, task, SubmitFlags::empty())
            .unwrap();
    }

    manager
        .cancel(server, Some(&task_a), CancelFlags::RECV)
        .unwrap();
    assert_eq!(queue_a.drain().len(), 2);
    assert!(queue_b.is_empty());
    assert_eq!(manager.queued(server).unwrap(), (3, 0));

    manager.cancel(server, None, CancelFlags::RECV).unwrap();
    let sizes: Vec<usize> = queue_b
        .drain()
        .into_iter()
        .map(|event| {
            assert_eq!(event.result(), Err(SocketError::Canceled));
            event.into_io().unwrap().payload().as_region().unwrap().len()
        })
        .collect();
    assert_eq!(sizes, vec![10, 12, 14]);
}

#[test]
fn test_refused_is_hard_only_when_connected() {
    let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let mut manager = SocketManager::new().unwrap();
    let (queue, task) = task();

    // Connected: the ICMP error surfaces as a failed receive.
    let (connected, _) = bound_udp(&mut manager);
    manager
        .connect(connected, &closed_addr.into(), &task)
        .unwrap();
    assert_eq!(queue.pop().unwrap().result(), Ok(()));
    manager
        .recv_region(connected, vec![0; 16], 1, &task, SubmitFlags::empty())
        .unwrap();
    manager
        .send_region(connected, b"x".to_vec(), &SendMeta::default(), &task, SubmitFlags::empty())
        .unwrap();

    let events = poll_events(&mut manager, &queue, 2, Duration::from_secs(1));
    let recv = events
        .iter()
        .find(|e| matches!(e, SocketEvent::Recv(_)))
        .unwrap();
    assert_eq!(recv.result(), Err(SocketError::ConnectionRefused));
    assert_eq!(manager.queued(connected).unwrap(), (0, 0));

    // Unconnected: the error belongs to no pending request.
    let (unconnected, _) = bound_udp(&mut manager);
    manager
        .recv_region(unconnected, vec![0; 16], 1, &task, SubmitFlags::empty())
        .unwrap();
    manager
        .send_region(
            unconnected,
            b"x".to_vec(),
            &SendMeta::new(closed_addr.into()),
            &task,
            SubmitFlags::empty(),
        )
        .unwrap();

    let events = poll_events(&mut manager, &queue, 2, Duration::from_millis(200));
    assert!(
        events
            .iter()
            .all(|e| matches!(e, SocketEvent::Send(_)) && e.result() == Ok(()))
    );
    assert_eq!(manager.queued(unconnected).unwrap(), (1, 0));
}
