use std::thread;

use bibw_shared::{
    transport::loopback::LoopbackTransport, BenchConfig, Role, RoleOrchestrator, SizeResult,
    State,
};

fn config(role: Role) -> BenchConfig {
    BenchConfig {
        role,
        max_msg_log: 12,
        iterations: 8,
        window_depth: 16,
        ..Default::default()
    }
}

#[test]
fn both_roles_complete_over_an_in_process_link() {
    let (listener, connector) = LoopbackTransport::pair();

    let (listened, connected) = thread::scope(|s| {
        let listener = s.spawn(move || {
            let mut orchestrator =
                RoleOrchestrator::new(config(Role::Listener { port: 0 }), listener);
            let mut results = Vec::new();
            orchestrator.run(&mut results).map(|()| (results, orchestrator.state()))
        });

        let connector = s.spawn(move || {
            let role = Role::Connector {
                addr: "127.0.0.1:0".parse().unwrap(),
            };
            let mut orchestrator = RoleOrchestrator::new(config(role), connector);
            let mut results = Vec::new();
            orchestrator.run(&mut results).map(|()| (results, orchestrator.state()))
        });

        (listener.join().unwrap(), connector.join().unwrap())
    });

    for (results, state) in [listened.unwrap(), connected.unwrap()] {
        let results: Vec<SizeResult> = results;

        assert_eq!(state, State::Closed);
        assert_eq!(results.len(), 12);
        assert!(results.windows(2).all(|pair| pair[0].size < pair[1].size));
        assert!(results
            .iter()
            .all(|result| result.bandwidth_gbps.is_finite() && result.bandwidth_gbps > 0.0));
    }
}

#[test]
fn a_vanished_peer_fails_the_listener() {
    let (listener, connector) = LoopbackTransport::pair();
    drop(connector);

    let mut orchestrator = RoleOrchestrator::new(config(Role::Listener { port: 0 }), listener);

    assert!(orchestrator.run(&mut Vec::new()).is_err());
    assert_eq!(orchestrator.history(), [State::Idle, State::Listening]);
}
