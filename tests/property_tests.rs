use std::sync::Arc;

use filament::{
    Failure, FnWorkflow, Payload, Process, Request, RequestKind, Response, WorkflowContext,
};
use proptest::prelude::*;
use serde_json::json;

mod common;
use common::RecordingTransport;

fn process_with<F, Fut>(transport: Arc<RecordingTransport>, body: F) -> Process
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
{
    let ctx = WorkflowContext::new("run-prop", transport);
    Process::new(ctx, Arc::new(FnWorkflow(body)))
}

/// Drive a sequential chain of activities, one response per step, and
/// return the outbound request stream.
fn chain_requests(values: &[String]) -> Vec<Request> {
    let transport = RecordingTransport::new();
    let steps = values.len();
    let process = process_with(transport.clone(), move |ctx, _input| async move {
        let mut acc = json!("start");
        for i in 0..steps {
            acc = ctx.execute_activity("Step", vec![json!(i), acc]).await?;
        }
        Ok(acc)
    });

    process.start(Payload::Null);
    for value in values {
        let id = transport.last_id_of(RequestKind::ExecuteActivity);
        process.dispatch(Response::ok(id, json!(value)));
    }
    assert!(process.is_terminal());
    transport.sent()
}

/// Fan out three activities, deliver their responses in the given order,
/// then run a final aggregation step.
fn fan_out_requests(order: [usize; 3]) -> Vec<Request> {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        let outcomes = ctx
            .join(vec![
                ctx.execute_activity("Fetch", vec![json!("a")]),
                ctx.execute_activity("Fetch", vec![json!("b")]),
                ctx.execute_activity("Fetch", vec![json!("c")]),
            ])
            .await;
        let mut merged = Vec::new();
        for outcome in outcomes {
            merged.push(outcome?);
        }
        let summary = ctx.execute_activity("Merge", vec![Payload::from(merged)]).await?;
        Ok(summary)
    });

    process.start(Payload::Null);
    let ids = transport.ids_of(RequestKind::ExecuteActivity);
    for slot in order {
        process.dispatch(Response::ok(ids[slot], json!(format!("value-{slot}"))));
    }
    let merge_id = transport.last_id_of(RequestKind::ExecuteActivity);
    process.dispatch(Response::ok(merge_id, json!("merged")));
    assert!(process.is_terminal());
    transport.sent()
}

const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

proptest! {
    /// Re-running the same code against the same response sequence must
    /// reproduce the identical outbound request stream.
    #[test]
    fn sequential_chains_replay_identically(
        values in prop::collection::vec("[a-z]{1,8}", 1..5)
    ) {
        prop_assert_eq!(chain_requests(&values), chain_requests(&values));
    }

    #[test]
    fn fan_out_replays_identically_for_any_completion_order(index in 0usize..6) {
        let order = PERMUTATIONS[index];
        let first = fan_out_requests(order);
        let second = fan_out_requests(order);
        prop_assert_eq!(&first, &second);
        // The issue order never depends on the completion order.
        let kinds: Vec<RequestKind> = first.iter().map(|r| r.kind).collect();
        prop_assert_eq!(kinds, vec![
            RequestKind::ExecuteActivity,
            RequestKind::ExecuteActivity,
            RequestKind::ExecuteActivity,
            RequestKind::ExecuteActivity,
            RequestKind::CompleteWorkflow,
        ]);
    }
}
