//! UDP and TCP echo server built on the socket manager.

use clap::Parser;
use sockmgr::{
    AddressFamily, BindOptions, Buffer, BufferList, CancelFlags, EventQueue, ManagerConfig,
    SendMeta, SocketEvent, SocketError, SocketId, SocketManager, SocketManagerBuilder, SocketType,
    SubmitFlags, TaskRef, logging,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BUFFER_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "sockmgr-echo")]
#[command(about = "Echo server on the sockmgr reactor")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Address to echo UDP datagrams on
    #[arg(long)]
    udp: Option<SocketAddr>,

    /// Address to accept TCP connections on
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match ManagerConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => ManagerConfig::default(),
    };

    if args.udp.is_none() && args.tcp.is_none() {
        eprintln!("Nothing to serve. Use --udp <addr> and/or --tcp <addr>");
        std::process::exit(1);
    }

    logging::init(&config.logging);

    let shutdown = install_signal_handler();

    if let Err(e) = run(config, &args, &shutdown) {
        tracing::error!(error = %e, "Echo server error");
        std::process::exit(1);
    }
}

fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("Received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("Received shutdown signal");
    }) {
        tracing::warn!(error = %e, "Failed to set signal handler");
    }

    shutdown
}

fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn fresh_buffers() -> BufferList {
    BufferList::single(Buffer::with_capacity(BUFFER_SIZE))
}

struct Echo {
    manager: SocketManager,
    task: TaskRef,
    udp: Option<SocketId>,
    listener: Option<SocketId>,
    connections: Vec<SocketId>,
}

impl Echo {
    fn open(&mut self, addr: SocketAddr, kind: SocketType) -> Result<SocketId, SocketError> {
        let id = self.manager.create(family_of(&addr), kind)?;
        self.manager
            .bind(id, &addr.into(), BindOptions::REUSE_ADDRESS)?;
        let local = self.manager.local_addr(id)?;
        tracing::info!(socket = %id, %kind, addr = ?local.as_socket(), "listening");
        Ok(id)
    }

    fn recv(&mut self, id: SocketId, minimum: usize) {
        let task = self.task.clone();
        if let Err(e) = self
            .manager
            .recv(id, fresh_buffers(), minimum, &task, SubmitFlags::empty())
        {
            tracing::warn!(socket = %id, error = %e, "recv submit failed");
        }
    }

    fn handle(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Recv(ev) if Some(ev.socket()) == self.udp => {
                let id = ev.socket();
                match (ev.result(), ev.address()) {
                    (Ok(()), Some(source)) => {
                        tracing::debug!(socket = %id, bytes = ev.n(), "datagram");
                        let meta = SendMeta::new(source.clone());
                        let data = BufferList::single(Buffer::from_slice(&ev.data()));
                        let task = self.task.clone();
                        if let Err(e) =
                            self.manager
                                .send_to(id, data, &meta, &task, SubmitFlags::empty())
                        {
                            tracing::warn!(socket = %id, error = %e, "send submit failed");
                        }
                    }
                    (Err(SocketError::Canceled), _) => return,
                    (result, _) => tracing::warn!(socket = %id, ?result, "datagram recv failed"),
                }
                self.recv(id, 1);
            }
            SocketEvent::Recv(ev) => {
                let id = ev.socket();
                match ev.result() {
                    Ok(()) => {
                        let data = BufferList::single(Buffer::from_slice(&ev.data()));
                        let task = self.task.clone();
                        if let Err(e) = self.manager.send(id, data, &task, SubmitFlags::empty()) {
                            tracing::warn!(socket = %id, error = %e, "send submit failed");
                        }
                        self.recv(id, 1);
                    }
                    Err(SocketError::Canceled) => {}
                    Err(e) => {
                        tracing::debug!(socket = %id, error = %e, "connection closed");
                        self.close(id);
                    }
                }
            }
            SocketEvent::Send(ev) => {
                if let Err(e) = ev.result() {
                    tracing::warn!(socket = %ev.socket(), error = %e, "send failed");
                }
            }
            SocketEvent::Accept(ev) => {
                if let Some(conn) = ev.accepted() {
                    tracing::info!(socket = %conn, peer = ?ev.address().and_then(|a| a.as_socket()), "accepted");
                    self.connections.push(conn);
                    self.recv(conn, 1);
                } else if let Err(e) = ev.result() {
                    if e == SocketError::Canceled {
                        return;
                    }
                    tracing::warn!(error = %e, "accept failed");
                }
                let task = self.task.clone();
                if let Err(e) = self.manager.accept(ev.socket(), &task) {
                    tracing::error!(error = %e, "accept submit failed");
                }
            }
            SocketEvent::Connect(_) => {}
        }
    }

    fn close(&mut self, id: SocketId) {
        self.connections.retain(|c| *c != id);
        if let Err(e) = self.manager.detach(id) {
            tracing::warn!(socket = %id, error = %e, "detach failed");
        }
    }

    fn shutdown(&mut self) {
        let sockets: Vec<SocketId> = self
            .udp
            .iter()
            .chain(self.listener.iter())
            .chain(self.connections.iter())
            .copied()
            .collect();
        for id in sockets {
            let _ = self.manager.cancel(id, None, CancelFlags::ALL);
            let _ = self.manager.detach(id);
        }
        self.connections.clear();
    }
}

fn run(
    config: ManagerConfig,
    args: &Args,
    shutdown: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = SocketManagerBuilder::from_config(config).build()?;
    let queue = EventQueue::new();

    let mut echo = Echo {
        manager,
        task: queue.clone(),
        udp: None,
        listener: None,
        connections: Vec::new(),
    };

    if let Some(addr) = args.udp {
        let id = echo.open(addr, SocketType::Datagram)?;
        echo.udp = Some(id);
        echo.recv(id, 1);
    }

    if let Some(addr) = args.tcp {
        let id = echo.open(addr, SocketType::Stream)?;
        echo.manager.listen(id, 0)?;
        let task = echo.task.clone();
        echo.manager.accept(id, &task)?;
        echo.listener = Some(id);
    }

    while !shutdown.load(Ordering::Relaxed) {
        echo.manager.run_once(Some(Duration::from_millis(100)))?;
        while let Some(event) = queue.pop() {
            echo.handle(event);
        }
    }

    echo.shutdown();
    queue.drain();
    // one more pass closes the released descriptors
    echo.manager.dispatch(&Default::default());
    tracing::info!("Echo server stopped");
    Ok(())
}

fn print_default_config() {
    let config = r#"# sockmgr-echo configuration

# Upper bound on open sockets
max_sockets = 4096

# Readiness events collected per reactor pass
events_capacity = 1024

[socket]
# Send IPv6 stream traffic at the minimum MTU
use_min_mtu = true
# Report receive timestamps on datagram sockets
timestamps = true
# Report destination address and interface on IPv6 datagram sockets
packet_info = true
# Report the DSCP of received datagrams
receive_dscp = false
# Mark DSCP per packet (true) or per socket (false); unset picks per socket type
# packet_dscp = true

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty" (human-readable), "json", or "compact"
format = "pretty"
timestamps = true
target = false
"#;
    print!("{}", config);
}
