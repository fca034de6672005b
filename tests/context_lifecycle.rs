mod common;

use common::{write_file, Fixture};
use llamactx_core::{
    params::{BenchParams, ChatTemplateOptions, LoraAdapter, MultimodalParams, VocoderParams},
    CompletionParams, ContextEvent, ContextState, EmbeddingParams, Error, RequestId,
    RequestOutcome, RerankParams,
};
use std::time::{Duration, Instant};

#[test]
fn test_release_twice_is_noop() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert_eq!(context.state(), ContextState::Ready);

    context.release();
    context.release();
    assert_eq!(context.state(), ContextState::Released);
}

#[test]
fn test_interrupt_load_on_ready_context() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    context.interrupt_load().unwrap();
    assert_eq!(context.state(), ContextState::Ready);
    assert_eq!(context.tokenize("ok", &[]).unwrap().tokens, vec![111, 107]);
}

#[test]
fn test_operations_after_release_fail() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.embedding_options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    fx.pool.release(id);

    let released = |result: Result<(), Error>| match result {
        Err(Error::AlreadyReleased(got)) => assert_eq!(got, id),
        other => panic!("expected AlreadyReleased, got {:?}", other),
    };
    released(context.completion(&CompletionParams::with_prompt("hi")).map(drop));
    released(context.tokenize("hi", &[]).map(drop));
    released(context.detokenize(&[104, 105]).map(drop));
    released(context.embedding("hi", &EmbeddingParams::default()).map(drop));
    released(
        context
            .rerank("q", &["doc".to_string()], &RerankParams::default())
            .map(drop),
    );
    released(context.bench(&BenchParams::default()).map(drop));
    released(context.stop_completion());
    released(context.interrupt_load());
    released(context.is_predicting().map(drop));
    released(context.enable_parallel_mode(2, 512).map(drop));
    released(context.queue_completion(&CompletionParams::with_prompt("hi")).map(drop));
    released(context.is_multimodal_enabled().map(drop));
    released(context.loaded_lora_adapters().map(drop));
    released(context.save_session(&fx.path("s.bin"), None).map(drop));
    released(context.load_session(&fx.path("s.bin")).map(drop));
    released(context.apply_lora_adapters(&[LoraAdapter::new("a.gguf", 1.0)]));
    released(context.remove_lora_adapters());
    released(context.disable_parallel_mode());
    released(context.parallel_state().map(drop));
    released(context.cancel_request(RequestId(1)).map(drop));
    released(context.outstanding_requests().map(drop));
    released(context.queue_embedding("hi", &EmbeddingParams::default()).map(drop));
    released(
        context
            .queue_rerank("q", &["doc".to_string()], &RerankParams::default())
            .map(drop),
    );
    released(context.formatted_chat("[]", "").map(drop));
    released(
        context
            .formatted_chat_jinja("[]", &ChatTemplateOptions::default())
            .map(drop),
    );
    released(context.multimodal_support().map(drop));
    released(context.release_multimodal());
    released(context.init_vocoder(&VocoderParams::new(fx.path("v.gguf"))).map(drop));
    released(context.is_vocoder_enabled().map(drop));
    released(context.formatted_audio_completion("", "hello").map(drop));
    released(context.audio_guide_tokens("hello").map(drop));
    released(context.decode_audio_tokens(&[0, 255]).map(drop));
    released(context.release_vocoder());

    assert!(matches!(fx.pool.resolve(id), Err(Error::NotFound(_))));
}

#[test]
fn test_released_check_precedes_validation() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    fx.pool.release(id);

    let released = |result: Result<(), Error>| {
        assert!(
            matches!(result, Err(Error::AlreadyReleased(got)) if got == id),
            "expected AlreadyReleased, got {:?}",
            result
        )
    };
    released(context.completion(&CompletionParams::default()).map(drop));
    released(context.tokenize("", &[]).map(drop));
    released(context.load_session(&fx.path("missing.bin")).map(drop));
    released(context.load_session("").map(drop));
    released(context.apply_lora_adapters(&[LoraAdapter::new("", 1.0)]));
    released(context.init_multimodal(&MultimodalParams::new(fx.path("missing.gguf"))).map(drop));
    released(context.init_vocoder(&VocoderParams::new("")).map(drop));
    released(context.enable_parallel_mode(0, 0).map(drop));
    released(context.queue_completion(&CompletionParams::default()).map(drop));
}

#[test]
fn test_release_does_not_wait_for_queued_blocking_call() {
    let fx = Fixture::slow(1, 5);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let prompt = "p".repeat(400);

    std::thread::scope(|scope| {
        // The second call waits for the first to leave the engine
        let workers: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| context.completion(&CompletionParams::with_prompt(prompt.clone()))))
            .collect();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        fx.pool.release(id);
        assert!(started.elapsed() < Duration::from_millis(500));

        for worker in workers {
            match worker.join().unwrap() {
                Ok(result) => {
                    assert!(result.interrupted);
                    assert!(result.tokens_predicted < 400);
                }
                Err(err) => assert!(matches!(err, Error::AlreadyReleased(_))),
            }
        }
    });
    assert!(context.is_released());
}

#[test]
fn test_blocking_completion_publishes_events() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let mut events = fx.pool.subscribe(id).unwrap();

    let mut streamed = String::new();
    let result = context
        .completion_with(&CompletionParams::with_prompt("hey"), |chunk| {
            streamed.push_str(&chunk.token)
        })
        .unwrap();
    assert_eq!(result.text, "hey");
    assert_eq!(streamed, "hey");

    let mut tokens = 0;
    loop {
        match events.try_recv() {
            Some(ContextEvent::Token { request_id, .. }) => {
                assert_eq!(request_id, None);
                tokens += 1;
            }
            Some(ContextEvent::Completion { request_id, outcome }) => {
                assert_eq!(request_id, None);
                assert_eq!(outcome, RequestOutcome::Completed(result.clone()));
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(tokens, 3);
    assert!(events.try_recv().is_none());
}

#[test]
fn test_missing_arguments_rejected_before_engine() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.embedding_options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let mut events = fx.pool.subscribe(id).unwrap();

    assert!(matches!(
        context.completion(&CompletionParams::default()),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(context.tokenize("", &[]), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        context.rerank("query", &[], &RerankParams::default()),
        Err(Error::InvalidArgument(msg)) if msg == "Documents cannot be empty"
    ));
    assert!(matches!(
        context.formatted_chat("", ""),
        Err(Error::InvalidArgument(_))
    ));
    assert!(events.try_recv().is_none());
}

#[test]
fn test_stop_completion_from_another_thread() {
    let fx = Fixture::slow(1, 5);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let prompt = "x".repeat(2000);

    let result = std::thread::scope(|scope| {
        let worker = scope.spawn(|| context.completion(&CompletionParams::with_prompt(prompt.clone())));
        while !context.is_predicting().unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
        context.stop_completion().unwrap();
        worker.join().unwrap()
    })
    .unwrap();

    assert!(result.interrupted);
    assert!(result.text.len() < 2000);
    assert!(!context.is_predicting().unwrap());
}

#[test]
fn test_release_interrupts_running_completion() {
    let fx = Fixture::slow(1, 5);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();

    std::thread::scope(|scope| {
        let worker = scope.spawn(|| context.completion(&CompletionParams::with_prompt("y".repeat(2000))));
        while !context.is_predicting().unwrap_or(false) {
            std::thread::sleep(Duration::from_millis(1));
        }
        fx.pool.release(id);
        let result = worker.join().unwrap().unwrap();
        assert!(result.interrupted);
    });
    assert!(context.is_released());
}

#[test]
fn test_tokenize_detokenize() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let tokenized = context.tokenize("abc", &[]).unwrap();
    assert_eq!(tokenized.tokens, vec![97, 98, 99]);
    assert!(!tokenized.has_media);
    assert_eq!(context.detokenize(&tokenized.tokens).unwrap(), "abc");
}

#[test]
fn test_embedding_requires_embedding_context() {
    let fx = Fixture::new(2);
    let (plain, _) = fx.pool.create(&fx.options()).unwrap();
    let err = fx
        .pool
        .resolve(plain)
        .unwrap()
        .embedding("hello", &EmbeddingParams::default())
        .unwrap_err();
    assert!(matches!(err, Error::EngineFailure(_)));

    let (embedder, _) = fx.pool.create(&fx.embedding_options()).unwrap();
    let context = fx.pool.resolve(embedder).unwrap();
    let vector = context.embedding("hello", &EmbeddingParams::default()).unwrap();
    assert_eq!(vector.len(), llamactx_core::engine::loopback::EMBEDDING_DIM);

    let docs = vec!["red apple".to_string(), "green pear".to_string()];
    let scores = context.rerank("apple", &docs, &RerankParams::default()).unwrap();
    assert_eq!(scores.len(), 2);
    assert!(scores[0].score > scores[1].score);
}

#[test]
fn test_session_roundtrip() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    context
        .completion(&CompletionParams::with_prompt("abcd").n_predict(0))
        .unwrap();

    let path = fx.path("state.session");
    assert_eq!(context.save_session(&path, None).unwrap(), 4);
    let loaded = context.load_session(&path).unwrap();
    assert_eq!(loaded.tokens_loaded, 4);
    assert_eq!(loaded.prompt, "abcd");

    assert!(matches!(
        context.load_session(&fx.path("nope.session")),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(context.save_session("", None), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_lora_adapters() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    assert!(context.loaded_lora_adapters().unwrap().is_empty());

    let adapter = write_file(fx.dir.path(), "style.gguf", b"GGUF");
    let adapters = vec![LoraAdapter::new(adapter.to_string_lossy(), 0.5)];
    context.apply_lora_adapters(&adapters).unwrap();
    assert_eq!(context.loaded_lora_adapters().unwrap(), adapters);

    let missing = vec![LoraAdapter::new(fx.path("gone.gguf"), 1.0)];
    match context.apply_lora_adapters(&missing) {
        Err(Error::EngineFailure(msg)) => {
            assert!(msg.starts_with("Failed to apply lora adapters"))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        context.apply_lora_adapters(&[LoraAdapter::new("", 1.0)]),
        Err(Error::InvalidArgument(_))
    ));

    context.remove_lora_adapters().unwrap();
    assert!(context.loaded_lora_adapters().unwrap().is_empty());
}

#[test]
fn test_chat_formatting() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let messages = r#"[{"role":"user","content":"hi"}]"#;

    let prompt = context.formatted_chat(messages, "").unwrap();
    assert!(prompt.contains("<|user|>\nhi"));
    assert!(prompt.ends_with("<|assistant|>\n"));

    assert!(matches!(
        context.formatted_chat("not json", ""),
        Err(Error::EngineFailure(_))
    ));
}

#[test]
fn test_bench_report_is_json() {
    let fx = Fixture::new(1);
    let (id, _) = fx.pool.create(&fx.options()).unwrap();
    let context = fx.pool.resolve(id).unwrap();
    let report = context.bench(&BenchParams::default()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(parsed.as_array().map(Vec::len), Some(7));
}
