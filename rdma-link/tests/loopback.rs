use std::sync::Arc;

use rdma_link::config::{LinkConfig, Operation, Readiness};
use rdma_link::rdma_shim::audit::{AuditedVerbs, Call, Resource};
use rdma_link::rdma_shim::soft::SoftFabric;
use rdma_link::rdma_shim::{Error, QpState, WcStatus};
use rdma_link::rendezvous::{self, Role, StreamTransport};
use rdma_link::session::{self, run_loopback, LocalEndpoint};
use rdma_link::{
    ControlpathError, DatapathError, LinkError, MemoryRegion, QueuePairBuilder, QueuePairStatus,
    UDriver,
};

fn audited() -> (Arc<AuditedVerbs<SoftFabric>>, Arc<UDriver>) {
    let audit = Arc::new(AuditedVerbs::new(SoftFabric::new()));
    let driver = UDriver::with_provider(audit.clone()).expect("failed to query device");
    (audit, driver)
}

fn quick(operation: Operation) -> LinkConfig {
    LinkConfig {
        operation,
        warmup_ms: 0,
        settle_ms: 0,
        ..Default::default()
    }
}

fn assert_clean_teardown(audit: &AuditedVerbs<SoftFabric>) {
    let calls = audit.calls();
    assert!(
        !calls
            .iter()
            .any(|c| matches!(c, Call::OutOfOrder { .. } | Call::Failed { .. })),
        "{:?}",
        calls
    );
    assert_eq!(audit.live_count(), 0);
    assert_eq!(audit.inner().live_resources(), 0);
}

#[test]
fn write_lands_in_the_responder_region() {
    let (audit, driver) = audited();
    let (initiator, responder) = run_loopback(&driver, &quick(Operation::Write)).expect("loopback");

    let wc = initiator.completion.expect("initiator polls");
    assert_eq!(wc.status, WcStatus::Success);
    assert_eq!(wc.byte_len, 4);

    for head in [&initiator.head, &responder.head] {
        assert_eq!(head.len(), 20);
        assert_eq!(&head[..8], &[0u8; 8]);
        assert_eq!(&head[8..12], &[1u8; 4]);
        assert!(head[12..].iter().all(|b| *b == 0));
    }
    assert_clean_teardown(&audit);
}

#[test]
fn read_pulls_from_the_responder_region() {
    let (audit, driver) = audited();
    let (initiator, _) = run_loopback(&driver, &quick(Operation::Read)).expect("loopback");
    assert_eq!(&initiator.head[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1]);
    assert_clean_teardown(&audit);
}

#[test]
fn each_side_tears_down_in_reverse_creation_order() {
    let (audit, driver) = audited();
    run_loopback(&driver, &quick(Operation::Write)).expect("loopback");

    // an out-of-order destroy would have been refused and recorded
    let destroyed = audit.destroyed();
    assert_eq!(destroyed.len(), 10);
    for rank in 0..5u8 {
        assert_eq!(
            destroyed.iter().filter(|r| r.rank() == rank).count(),
            2,
            "{:?}",
            destroyed
        );
    }
    assert_clean_teardown(&audit);
}

#[test]
fn delay_mode_still_completes() {
    let (audit, driver) = audited();
    let cfg = LinkConfig {
        readiness: Readiness::Delay,
        warmup_ms: 10,
        // the responder must outlive the initiator's op
        settle_ms: 300,
        ..quick(Operation::Write)
    };
    let (initiator, responder) = run_loopback(&driver, &cfg).expect("loopback");
    assert!(initiator.completion.expect("completion").status.is_success());
    assert_eq!(&responder.head[8..12], &[1u8; 4]);
    assert_clean_teardown(&audit);
}

#[test]
fn exhausted_budget_still_tears_down_both_sides() {
    let (audit, driver) = audited();
    let cfg = LinkConfig {
        poll_budget: 0,
        ..quick(Operation::Write)
    };
    assert!(matches!(
        run_loopback(&driver, &cfg),
        Err(LinkError::Data(DatapathError::PollBudgetExhausted(0)))
    ));
    assert_clean_teardown(&audit);
}

#[test]
fn queried_state_follows_every_transition() {
    let (_audit, driver) = audited();
    let cfg = quick(Operation::Read);
    let a = LocalEndpoint::create(&driver, &cfg).expect("a");
    let b = LocalEndpoint::create(&driver, &cfg).expect("b");
    let qp = a.queue_pair();
    let peer = b.connection_identifiers().expect("ids");

    assert_eq!(qp.status().expect("status"), QueuePairStatus::Reset);
    qp.modify_to_init().expect("init");
    assert_eq!(qp.status().expect("status"), QueuePairStatus::Init);
    qp.modify_to_rtr(peer.lid, peer.qpn).expect("rtr");
    assert_eq!(qp.status().expect("status"), QueuePairStatus::ReadyToRecv);
    qp.modify_to_rts().expect("rts");
    assert_eq!(qp.status().expect("status"), QueuePairStatus::ReadyToSend);

    a.teardown().expect("a");
    b.teardown().expect("b");
}

#[test]
fn unknown_peer_aborts_at_rtr() {
    let (audit, driver) = audited();
    let a = LocalEndpoint::create(&driver, &quick(Operation::Read)).expect("a");

    let err = a
        .queue_pair()
        .bring_up_rc(42, 0xdead)
        .expect_err("no such peer");
    match err {
        ControlpathError::TransitionError { from, to, errno } => {
            assert_eq!(from, QueuePairStatus::Init);
            assert_eq!(to, QueuePairStatus::ReadyToRecv);
            assert_eq!(errno, Error::EINVAL);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(a.status().expect("status"), QueuePairStatus::Error);
    a.teardown().expect("teardown");
    assert_eq!(audit.live_count(), 0);
}

#[test]
fn remote_op_before_peer_connects_back_fails() {
    let (_audit, driver) = audited();
    let cfg = quick(Operation::Write);
    let mut a = LocalEndpoint::create(&driver, &cfg).expect("a");
    let mut b = LocalEndpoint::create(&driver, &cfg).expect("b");
    a.connect(&b.connection_identifiers().expect("ids")).expect("a up");
    a.register_region(256).expect("a mr");
    let peer_region = b.register_region(256).expect("b mr");

    // b never left RESET
    match a.execute(&cfg, &peer_region) {
        Err(LinkError::Data(DatapathError::CompletionError { status, wr_id })) => {
            assert_eq!(status, WcStatus::RetryExcErr);
            assert_eq!(wr_id, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(a.status().expect("status"), QueuePairStatus::Error);
    a.teardown().expect("a");
    b.teardown().expect("b");
}

#[test]
fn out_of_order_teardown_is_detected() {
    let (audit, driver) = audited();
    let ctx = driver
        .get_dev(0)
        .expect("no rdma device available")
        .open_context()
        .expect("ctx");
    let qp = QueuePairBuilder::new(&ctx).build_rc().expect("qp");
    let mr = MemoryRegion::new(ctx.clone(), 64).expect("mr");

    // the QP must not go while the region is still registered
    assert!(matches!(
        qp.destroy(),
        Err(ControlpathError::DestroyError("QP", Error::EBUSY))
    ));
    assert!(audit.calls().iter().any(|c| matches!(
        c,
        Call::OutOfOrder {
            target: Resource::Qp(_),
            blocker: Resource::Mr(_)
        }
    )));

    // the context is still referenced by the region
    assert!(matches!(
        ctx.clone().destroy(),
        Err(ControlpathError::TeardownOrder("context"))
    ));
    drop(mr);
    drop(ctx);
}

#[test]
fn readiness_ack_reports_rts() {
    let (audit, driver) = audited();
    run_loopback(&driver, &quick(Operation::Read)).expect("loopback");
    let to_rts = audit
        .calls()
        .iter()
        .filter(|c| {
            matches!(
                c,
                Call::ModifyQp {
                    to: Some(QpState::ReadyToSend),
                    ..
                }
            )
        })
        .count();
    assert_eq!(to_rts, 2);
}

#[test]
fn peers_on_separate_fabrics_fail_at_rtr() {
    let cfg = quick(Operation::Write);
    let listener = rendezvous::listen_once("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let responder = {
        let cfg = cfg.clone();
        std::thread::spawn(move || {
            let (audit, driver) = audited();
            let stream = rendezvous::connect(addr, cfg.warmup()).expect("connect");
            let res = session::run(&driver, &cfg, Role::Responder, StreamTransport::new(stream));
            (audit, res)
        })
    };

    let (audit, driver) = audited();
    let stream = rendezvous::accept_once(listener).expect("accept");
    let res = session::run(&driver, &cfg, Role::Initiator, StreamTransport::new(stream));
    let (peer_audit, peer_res) = responder.join().expect("responder");

    for res in [res, peer_res] {
        match res {
            Err(LinkError::Control(ControlpathError::TransitionError { from, to, .. })) => {
                assert_eq!(from, QueuePairStatus::Init);
                assert_eq!(to, QueuePairStatus::ReadyToRecv);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    for audit in [audit, peer_audit] {
        assert!(!audit
            .calls()
            .iter()
            .any(|c| matches!(c, Call::OutOfOrder { .. })));
        assert_eq!(audit.live_count(), 0);
        assert_eq!(audit.inner().live_resources(), 0);
    }
}
