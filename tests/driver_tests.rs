use std::sync::Arc;

use filament::{
    Failure, FnWorkflow, Payload, Process, ProcessStatus, RequestKind, Response, WorkflowContext,
};
use serde_json::json;

mod common;
use common::RecordingTransport;

fn process_with<F, Fut>(transport: Arc<RecordingTransport>, body: F) -> Process
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
{
    let ctx = WorkflowContext::new("run-1", transport);
    Process::new(ctx, Arc::new(FnWorkflow(body)))
}

#[test]
fn body_completing_without_suspension_goes_terminal_in_start() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |_ctx, input| async move {
        Ok(json!({ "echo": input }))
    });

    process.start(json!("hello"));

    assert_eq!(
        process.status(),
        ProcessStatus::Completed {
            output: json!({ "echo": "hello" })
        }
    );
    assert_eq!(transport.sent_kinds(), vec![RequestKind::CompleteWorkflow]);
    let complete = transport.last_request();
    assert_eq!(complete.params[0], json!({ "echo": "hello" }));
    assert_eq!(complete.params[1], Payload::Null);
}

#[test]
fn activity_roundtrip_suspends_and_resumes() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        let greeting = ctx.execute_activity("Greet", vec![json!("world")]).await?;
        Ok(greeting)
    });

    process.start(Payload::Null);
    assert_eq!(process.status(), ProcessStatus::Suspended);
    assert_eq!(process.pending_requests(), 1);
    assert_eq!(transport.sent_kinds(), vec![RequestKind::ExecuteActivity]);

    let id = transport.last_id_of(RequestKind::ExecuteActivity);
    process.dispatch(Response::ok(id, json!("hello world")));

    assert_eq!(
        process.status(),
        ProcessStatus::Completed {
            output: json!("hello world")
        }
    );
    assert_eq!(process.pending_requests(), 0);
}

#[test]
fn one_dispatch_drains_every_already_resolved_step() {
    // The second await resumes inside the same driving step that resolved
    // the first one; only the newly-issued timer suspends the run again.
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        let first = ctx.execute_activity("A", vec![]).await?;
        ctx.timer(50).await?;
        Ok(first)
    });

    process.start(Payload::Null);
    let id = transport.last_id_of(RequestKind::ExecuteActivity);
    process.dispatch(Response::ok(id, json!(1)));

    assert_eq!(
        transport.sent_kinds(),
        vec![RequestKind::ExecuteActivity, RequestKind::Timer]
    );
    assert_eq!(process.status(), ProcessStatus::Suspended);

    let timer_id = transport.last_id_of(RequestKind::Timer);
    process.dispatch(Response::ok(timer_id, Payload::Null));
    assert_eq!(process.status(), ProcessStatus::Completed { output: json!(1) });
}

#[test]
fn rejected_request_surfaces_at_the_suspension_point() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        match ctx.execute_activity("Flaky", vec![]).await {
            Ok(value) => Ok(value),
            Err(failure) if !failure.is_cancellation() => Ok(json!("fallback")),
            Err(failure) => Err(failure),
        }
    });

    process.start(Payload::Null);
    let id = transport.last_id_of(RequestKind::ExecuteActivity);
    process.dispatch(Response::failed(
        id,
        Failure::application("Boom", "activity exploded"),
    ));

    assert_eq!(
        process.status(),
        ProcessStatus::Completed {
            output: json!("fallback")
        }
    );
}

#[test]
fn uncaught_failure_becomes_the_terminal_outcome() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        let value = ctx.execute_activity("Flaky", vec![]).await?;
        Ok(value)
    });

    process.start(Payload::Null);
    let id = transport.last_id_of(RequestKind::ExecuteActivity);
    let failure = Failure::application("Boom", "activity exploded");
    process.dispatch(Response::failed(id, failure.clone()));

    assert_eq!(process.status(), ProcessStatus::Failed { failure });
    // Same terminal request kind as success, with the failure field set.
    let complete = transport.last_request();
    assert_eq!(complete.kind, RequestKind::CompleteWorkflow);
    assert_eq!(complete.params[0], Payload::Null);
    assert_ne!(complete.params[1], Payload::Null);
}

#[test]
fn continue_as_new_retires_the_run_without_a_completion() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, input| async move {
        let next_input = json!({ "iteration": input["iteration"].as_i64().unwrap_or(0) + 1 });
        ctx.continue_as_new("Looping", next_input).await
    });

    process.start(json!({ "iteration": 3 }));

    assert_eq!(process.status(), ProcessStatus::ContinuedAsNew);
    assert_eq!(transport.sent_kinds(), vec![RequestKind::ContinueAsNew]);
    let request = transport.last_request();
    assert_eq!(request.params[0], json!("Looping"));
    assert_eq!(request.params[1], json!({ "iteration": 4 }));
}

#[test]
fn late_response_after_completion_is_ignored() {
    let transport = RecordingTransport::new();
    let process = process_with(transport.clone(), |ctx, _input| async move {
        let (winner, outcome) = ctx
            .race(vec![
                ctx.execute_activity("A", vec![]),
                ctx.execute_activity("B", vec![]),
            ])
            .await;
        outcome.map(|value| json!({ "winner": winner, "value": value }))
    });

    process.start(Payload::Null);
    let ids = transport.ids_of(RequestKind::ExecuteActivity);
    process.dispatch(Response::ok(ids[1], json!("b")));
    assert!(process.is_terminal());

    // The loser's response arrives after the run went terminal.
    process.dispatch(Response::ok(ids[0], json!("a")));
    assert_eq!(
        process.status(),
        ProcessStatus::Completed {
            output: json!({ "winner": 1, "value": "b" })
        }
    );
}

#[test]
#[should_panic(expected = "start() called twice")]
fn double_start_panics() {
    let transport = RecordingTransport::new();
    let process = process_with(transport, |ctx, _input| async move {
        ctx.timer(1).await?;
        Ok(Payload::Null)
    });
    process.start(Payload::Null);
    process.start(Payload::Null);
}

#[test]
#[should_panic(expected = "next() called before start()")]
fn next_before_start_panics() {
    let transport = RecordingTransport::new();
    let process = process_with(transport, |_ctx, _input| async move { Ok(Payload::Null) });
    process.next();
}

#[test]
#[should_panic(expected = "next() called on a terminal workflow process")]
fn next_after_completion_panics() {
    let transport = RecordingTransport::new();
    let process = process_with(transport, |_ctx, _input| async move { Ok(Payload::Null) });
    process.start(Payload::Null);
    process.next();
}
