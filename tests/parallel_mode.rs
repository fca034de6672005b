mod common;

use common::Fixture;
use llamactx_core::{
    context::ParallelState, engine::loopback::LoopbackConfig, CompletionParams, ContextEvent,
    Error, QueuedRequest, RequestOutcome,
};
use std::time::Duration;

fn terminal(request: &mut QueuedRequest) -> ContextEvent {
    loop {
        let event = request
            .blocking_next()
            .expect("request ended without a terminal event");
        if event.is_terminal() {
            return event;
        }
    }
}

#[test]
fn test_enable_disable_then_blocking_completion() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert_eq!(context.parallel_state().unwrap(), ParallelState::default());

    assert!(context.enable_parallel_mode(4, 256).unwrap());
    assert_eq!(
        context.parallel_state().unwrap(),
        ParallelState {
            enabled: true,
            n_parallel: 4,
            n_batch: 256,
        }
    );

    context.disable_parallel_mode().unwrap();
    assert!(!context.parallel_state().unwrap().enabled);
    let result = context
        .completion(&CompletionParams::with_prompt("still works"))
        .unwrap();
    assert_eq!(result.text, "still works");

    // Disabling twice is harmless
    context.disable_parallel_mode().unwrap();
}

#[test]
fn test_rejected_configuration_leaves_single_mode() {
    let fx = Fixture::with_engine(
        1,
        LoopbackConfig {
            max_parallel: 2,
            ..Default::default()
        },
    );
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();

    assert!(context.enable_parallel_mode(2, 512).unwrap());
    assert!(!context.enable_parallel_mode(8, 512).unwrap());
    assert!(!context.parallel_state().unwrap().enabled);
    assert!(matches!(
        context.queue_completion(&CompletionParams::with_prompt("x")),
        Err(Error::EngineFailure(_))
    ));
    assert!(context.completion(&CompletionParams::with_prompt("x")).is_ok());
}

#[test]
fn test_zero_sizes_rejected() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert!(matches!(
        context.enable_parallel_mode(0, 512),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        context.enable_parallel_mode(2, 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_reconfigure_keeps_queued_requests() {
    let fx = Fixture::slow(1, 2);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert!(context.enable_parallel_mode(1, 512).unwrap());

    let mut requests: Vec<_> = (0..3)
        .map(|i| {
            context
                .queue_completion(&CompletionParams::with_prompt(format!("req{}", i)))
                .unwrap()
        })
        .collect();

    // Loop restarts with more slots; nothing already accepted is lost
    assert!(context.enable_parallel_mode(3, 512).unwrap());

    for (i, request) in requests.iter_mut().enumerate() {
        match terminal(request) {
            ContextEvent::Completion { outcome, .. } => {
                assert_eq!(outcome.completed().unwrap().text, format!("req{}", i));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn test_disable_fails_pending_requests() {
    let fx = Fixture::slow(1, 5);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert!(context.enable_parallel_mode(1, 512).unwrap());

    let mut requests: Vec<_> = (0..3)
        .map(|_| {
            context
                .queue_completion(&CompletionParams::with_prompt("w".repeat(500)))
                .unwrap()
        })
        .collect();
    context.disable_parallel_mode().unwrap();

    for request in requests.iter_mut() {
        match terminal(request) {
            ContextEvent::Completion { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::Failed("Parallel mode disabled".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(context.outstanding_requests().unwrap().is_empty());
}

#[test]
fn test_release_with_running_loop() {
    let fx = Fixture::slow(1, 5);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert!(context.enable_parallel_mode(2, 512).unwrap());
    let mut events = fx.pool.subscribe(id).unwrap();

    let mut requests: Vec<_> = (0..4)
        .map(|_| {
            context
                .queue_completion(&CompletionParams::with_prompt("r".repeat(500)))
                .unwrap()
        })
        .collect();
    std::thread::sleep(Duration::from_millis(20));
    fx.pool.release(id);

    for request in requests.iter_mut() {
        assert!(matches!(
            terminal(request),
            ContextEvent::Completion { outcome: RequestOutcome::Failed(_), .. }
        ));
        assert!(request.blocking_next().is_none());
    }

    // The closed channel still drains, one terminal event per request
    let mut terminals = 0;
    while let Some(event) = events.try_recv() {
        if event.is_terminal() {
            terminals += 1;
        }
    }
    assert_eq!(terminals, 4);
    assert!(context.is_released());
}
