mod common;

use brain_control_rs::command_fsm::CommandStatus;
use brain_control_rs::command_queue::CommandQueue;
use brain_control_rs::dispatcher::DispatchOutcome;
use brain_control_rs::error::ControlError;
use brain_control_rs::model::{CommandPayload, CommandPriority, CommandType, TradeCommand};
use brain_control_rs::subjects::CMD_EMERGENCY_STOP;
use common::*;
use rust_decimal_macros::dec;

#[test]
fn test_priority_order_then_fifo() {
    let plane = control_plane(advice(0.5));
    let queue = CommandQueue::new(plane.store.clone(), plane.ctx.clone());
    let now = plane.ctx.time.now();

    for (id, priority) in [
        ("low", CommandPriority::Low),
        ("urgent", CommandPriority::Urgent),
        ("normal-1", CommandPriority::Normal),
        ("normal-2", CommandPriority::Normal),
        ("normal-3", CommandPriority::Normal),
    ] {
        queue.enqueue(&status_command(id, priority, now)).unwrap();
    }

    let mut served = Vec::new();
    while let Some(command) = queue.dequeue("exec-a").unwrap().command {
        assert_eq!(command.status(), CommandStatus::Executing);
        served.push(command.id);
    }
    assert_eq!(served, vec!["urgent", "normal-1", "normal-2", "normal-3", "low"]);
}

#[test]
fn test_zero_expiry_fails_without_dispatch() {
    let plane = control_plane(advice(0.5));
    let queue = CommandQueue::new(plane.store.clone(), plane.ctx.clone());
    let stale = status_command("stale", CommandPriority::High, plane.ctx.time.now()).with_expiry_ms(0);
    queue.enqueue(&stale).unwrap();

    let dequeued = queue.dequeue("exec-a").unwrap();
    assert!(dequeued.command.is_none());
    assert_eq!(dequeued.expired.len(), 1);

    let stored = plane.dispatcher.status("stale").unwrap();
    assert_eq!(stored.status(), CommandStatus::Failed);
    assert!(stored.dispatched_at.is_none());
    assert!(plane.transport.published().is_empty());
}

#[test]
fn test_oversized_expiry_is_rejected_on_submit() {
    let plane = control_plane(advice(0.5));
    let command = status_command("far", CommandPriority::Normal, plane.ctx.time.now())
        .with_expiry_ms(i64::MAX / 2);

    match plane.dispatcher.submit(command) {
        Err(ControlError::Validation(message)) => assert!(message.contains("exceeds"), "{message}"),
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(plane.store.load_command("far").unwrap().is_none());
}

#[test]
fn test_second_failure_with_one_retry_is_permanent() {
    let plane = control_plane(advice(0.5));
    let queue = CommandQueue::new(plane.store.clone(), plane.ctx.clone());
    let command =
        status_command("c-1", CommandPriority::Normal, plane.ctx.time.now()).with_max_retries(1);
    queue.enqueue(&command).unwrap();

    queue.dequeue("exec-a").unwrap().command.unwrap();
    assert_eq!(plane.dispatcher.retry("c-1", "request timed out").unwrap(), 1);
    assert_eq!(plane.dispatcher.status("c-1").unwrap().status(), CommandStatus::Pending);

    queue.dequeue("exec-a").unwrap().command.unwrap();
    match plane.dispatcher.retry("c-1", "request timed out") {
        Err(ControlError::PermanentDispatch { command_id, reason }) => {
            assert_eq!(command_id, "c-1");
            assert!(reason.starts_with("Retries exhausted (1)"));
        }
        other => panic!("expected a permanent dispatch error, got {other:?}"),
    }
    assert_eq!(plane.dispatcher.status("c-1").unwrap().status(), CommandStatus::Failed);
}

#[tokio::test]
async fn test_worker_exhausts_retries_without_responder() {
    let plane = control_plane(advice(0.5));
    let command =
        status_command("c-1", CommandPriority::Normal, plane.ctx.time.now()).with_max_retries(1);
    plane.dispatcher.submit(command).unwrap();

    let first = plane.dispatcher.dispatch_next("exec-a").await.unwrap().unwrap();
    assert!(matches!(first, DispatchOutcome::Retried { retry_count: 1, .. }));

    let second = plane.dispatcher.dispatch_next("exec-a").await.unwrap().unwrap();
    assert!(matches!(second, DispatchOutcome::Exhausted { .. }));
    assert_eq!(plane.dispatcher.status("c-1").unwrap().status(), CommandStatus::Failed);
    assert!(plane.dispatcher.dispatch_next("exec-a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_emergency_stop_flushes_queue() {
    let plane = control_plane(advice(0.5));
    let now = plane.ctx.time.now();
    let queued = ["a", "b", "c"];
    for id in queued {
        plane
            .dispatcher
            .submit(status_command(id, CommandPriority::Normal, now))
            .unwrap();
    }

    let report = plane
        .dispatcher
        .emergency_stop("Broker feed frozen", "risk-desk")
        .await
        .unwrap();

    assert!(plane.dispatcher.pending(None).unwrap().is_empty());
    for id in queued {
        assert_eq!(plane.dispatcher.status(id).unwrap().status(), CommandStatus::Cancelled);
    }
    assert_eq!(report.cancelled.len(), 3);
    assert!(report.broadcast_delivered);
    assert_eq!(plane.transport.published_on(CMD_EMERGENCY_STOP).len(), 1);

    let anomalies = plane.store.load_anomalies(true).unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].id, report.anomaly_id);
    assert!(anomalies[0].description.contains("Broker feed frozen"));

    // halted until resumed, even after the anomaly is reset
    let next = plane
        .dispatcher
        .submit(status_command("d", CommandPriority::Normal, now));
    assert!(matches!(next, Err(ControlError::Halted { .. })));
    plane.breaker.reset(&report.anomaly_id, "Feed restored").unwrap();
    assert!(plane.dispatcher.halt().is_halted("strat-1"));

    plane.dispatcher.halt().resume_all("Operator resumed").unwrap();
    plane
        .dispatcher
        .submit(status_command("e", CommandPriority::Normal, now))
        .unwrap();
}

#[test]
fn test_safety_violation_rejected_synchronously() {
    let plane = control_plane(advice(0.5));
    let signal = TradeCommand::new(
        "big",
        "strat-1",
        CommandType::TradeSignal,
        CommandPriority::High,
        CommandPayload {
            action: "OPEN".into(),
            order: Some(order(dec!(2.5))),
            ..Default::default()
        },
        plane.ctx.time.now(),
    )
    .with_target("exec-a");

    match plane.dispatcher.submit(signal) {
        Err(ControlError::SafetyViolation(reasons)) => {
            assert_eq!(reasons, vec!["Volume 2.50 exceeds max lot size 1.00".to_string()]);
        }
        other => panic!("expected a safety violation, got {other:?}"),
    }
    assert!(plane.store.load_command("big").unwrap().is_none());
}
