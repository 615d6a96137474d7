use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use bibw_shared::{
    sweep::{TableSink, REPORT_HEADER},
    transport::{
        tcp::{TcpEndpoint, TcpTransport},
        CompletionStatus, Opcode,
    },
    BenchConfig, BenchError, Endpoint, MemoryKind, MemoryRegion, Role, RoleOrchestrator, State,
    Transport,
};

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

fn config(role: Role) -> BenchConfig {
    BenchConfig {
        role,
        max_msg_log: 16,
        iterations: 4,
        window_depth: 8,
        ..Default::default()
    }
}

#[test]
fn listener_prints_one_line_per_size() {
    let port = free_port();

    let (table, connected) = thread::scope(|s| {
        let listener = s.spawn(move || {
            let transport = TcpTransport::new().bind_addr(Ipv4Addr::LOCALHOST.into());
            let mut table = TableSink::new(Vec::new());
            RoleOrchestrator::new(config(Role::Listener { port }), transport)
                .run(&mut table)
                .map(|()| table.into_inner())
        });

        let connector = s.spawn(move || {
            let transport = TcpTransport::new().connect_retries(100, Duration::from_millis(20));
            let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
            RoleOrchestrator::new(config(Role::Connector { addr }), transport)
                .run(&mut Vec::new())
        });

        (listener.join().unwrap(), connector.join().unwrap())
    });

    connected.unwrap();

    let table = String::from_utf8(table.unwrap()).unwrap();
    let lines: Vec<_> = table.lines().collect();

    assert_eq!(lines[0], REPORT_HEADER);
    assert_eq!(lines.len(), 1 + 16);

    for (exp, line) in lines[1..].iter().enumerate() {
        let (size, bandwidth) = line.split_once("\t\t").unwrap();
        assert_eq!(size.parse::<usize>().unwrap(), 1 << exp);
        assert!(bandwidth.parse::<f64>().unwrap() > 0.0);
    }
}

#[test]
fn connector_without_listener_fails_to_connect() {
    let port = free_port();
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);

    let mut orchestrator =
        RoleOrchestrator::new(config(Role::Connector { addr }), TcpTransport::new());

    assert!(matches!(
        orchestrator.run(&mut Vec::new()),
        Err(BenchError::Connection { .. })
    ));
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

fn connected_pair() -> (TcpEndpoint, TcpEndpoint) {
    let port = free_port();

    thread::scope(|s| {
        let listener = s.spawn(move || {
            TcpTransport::new()
                .bind_addr(Ipv4Addr::LOCALHOST.into())
                .accept(port)
                .unwrap()
        });

        let connector = TcpTransport::new()
            .connect_retries(100, Duration::from_millis(20))
            .connect(localhost(port))
            .unwrap();

        (listener.join().unwrap(), connector)
    })
}

#[test]
fn peer_eof_fails_every_queued_receive_once() {
    let (mut listener, connector) = connected_pair();
    drop(connector);

    let mut region = MemoryRegion::allocate(MemoryKind::Host, 16).unwrap();
    let first = unsafe { listener.post_recv(region.slice_mut(8).unwrap()).unwrap() };
    let second = unsafe { listener.post_recv(region.slice_mut(8).unwrap()).unwrap() };

    let mut completions = Vec::new();
    while listener.outstanding() > 0 {
        listener.poll(&mut completions).unwrap();
    }

    let failed: Vec<_> = completions
        .iter()
        .map(|wc| (wc.wr_id, wc.opcode, wc.is_success()))
        .collect();
    assert_eq!(
        failed,
        vec![
            (first.wr_id, Opcode::Recv, false),
            (second.wr_id, Opcode::Recv, false)
        ]
    );
    assert!(completions
        .iter()
        .all(|wc| matches!(wc.status, CompletionStatus::Failed(_))));

    listener.poll(&mut completions).unwrap();
    assert_eq!(completions.len(), 2);

    let later = unsafe { listener.post_recv(region.slice_mut(8).unwrap()) };
    assert!(matches!(later, Err(BenchError::Transfer { size: 8, .. })));
}

#[test]
fn listener_fails_and_closes_when_the_connector_vanishes() {
    let port = free_port();

    let (outcome, history, table) = thread::scope(|s| {
        let listener = s.spawn(move || {
            let transport = TcpTransport::new().bind_addr(Ipv4Addr::LOCALHOST.into());
            let mut orchestrator =
                RoleOrchestrator::new(config(Role::Listener { port }), transport);
            let mut table = TableSink::new(Vec::new());
            let outcome = orchestrator.run(&mut table);
            (outcome, orchestrator.history().to_vec(), table.into_inner())
        });

        // a peer that sends part of the first window and hangs up
        let mut attempts = 0;
        let mut stream = loop {
            match TcpStream::connect(localhost(port)) {
                Ok(stream) => break stream,
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("listener never came up: {e}"),
            }
        };
        stream.write_all(&[0; 3]).unwrap();
        drop(stream);

        listener.join().unwrap()
    });

    assert!(matches!(outcome, Err(BenchError::Transfer { size: 1, .. })));
    assert_eq!(
        history,
        [
            State::Idle,
            State::Listening,
            State::Connected,
            State::Running,
            State::Closed
        ]
    );
    assert_eq!(String::from_utf8(table).unwrap().lines().collect::<Vec<_>>(), [REPORT_HEADER]);
}
