use std::sync::Arc;

use slm_runtime::{Adapter, AdapterConfig, CancelToken, FinishReason, MockBackend, Request, StreamEvent};

fn build_adapter(configure: impl FnOnce(&mut AdapterConfig)) -> Adapter<MockBackend> {
    let backend = Arc::new(MockBackend::new());
    let mut config = AdapterConfig::new("mock.gguf");
    config.context_size = 256;
    config.generation_defaults.temperature = 0.0;
    configure(&mut config);
    Adapter::new(backend, config).unwrap()
}

#[test]
fn prefix_reuse_reports_exact_length() {
    let adapter = build_adapter(|c| c.generation_defaults.max_tokens = 4);
    let cancel = CancelToken::new();

    let resp1 = adapter.generate(&Request::new("System: be terse. User: hi"), &cancel).unwrap();
    let resp2 = adapter.generate(&Request::new("System: be terse. User: hi there friend"), &cancel).unwrap();

    assert_eq!(resp2.stats.tokens_cached, resp1.stats.tokens_evaluated);
}

#[test]
fn diverging_prompt_caps_reuse_and_matches_fresh_run() {
    let adapter = build_adapter(|c| c.generation_defaults.max_tokens = 6);
    let cancel = CancelToken::new();

    adapter.generate(&Request::new("alpha beta gamma"), &cancel).unwrap();
    let resp2 = adapter.generate(&Request::new("alpha beta delta"), &cancel).unwrap();

    // Shared prefix is "<bos> alpha beta" (3 tokens); "gamma"/"delta" diverge.
    assert!(resp2.stats.tokens_cached <= 3);

    let fresh = build_adapter(|c| c.generation_defaults.max_tokens = 6);
    let fresh_resp = fresh.generate(&Request::new("alpha beta delta"), &cancel).unwrap();
    assert_eq!(resp2.text, fresh_resp.text);
}

#[test]
fn identical_prompt_reports_zero_cached() {
    let adapter = build_adapter(|c| c.generation_defaults.max_tokens = 4);
    let cancel = CancelToken::new();

    adapter.generate(&Request::new("the same prompt twice"), &cancel).unwrap();
    let resp2 = adapter.generate(&Request::new("the same prompt twice"), &cancel).unwrap();

    assert_eq!(resp2.stats.tokens_cached, 0);
}

#[test]
fn context_shift_never_overflows() {
    let adapter = build_adapter(|c| {
        c.context_size = 64;
        c.context_shift = true;
        c.generation_defaults.max_tokens = 100;
    });
    let cancel = CancelToken::new();

    let prompt = "one two three four five six seven eight nine ten";
    let resp = adapter.generate(&Request::new(prompt), &cancel).unwrap();

    assert_eq!(resp.stats.tokens_generated, 100);
    assert_eq!(resp.finish, FinishReason::Length);
}

#[test]
fn stop_spanning_two_pieces_trims_exactly() {
    // Prompt tokenizes to ["<bos>", "x"] (2 tokens), which starts the mock's
    // 5-word generation cycle at index 2 (" the"), so the second and third
    // pieces (" answer", ".") land adjacent and together spell the stop. A
    // chunk size wide enough to hold all three pieces unflushed is what
    // lets the match get trimmed before anything is sent to the callback,
    // same as the spec's own chunk-boundary example.
    let adapter = build_adapter(|c| {
        c.stream_chunk_size = 4;
        c.generation_defaults.max_tokens = 10;
        c.generation_defaults.stop = vec![" answer.".to_string()];
    });
    let cancel = CancelToken::new();

    let resp = adapter.generate(&Request::new("x"), &cancel).unwrap();

    assert_eq!(resp.text, " the");
    assert_eq!(resp.finish, FinishReason::Stop);
}

#[test]
fn cancel_mid_stream_then_serves_next_request() {
    let adapter = build_adapter(|c| c.generation_defaults.max_tokens = 50);
    let cancel = CancelToken::new();

    let mut received = 0u32;
    let mut final_finish = None;
    adapter
        .stream(&Request::new("keep going please"), &cancel, |event| {
            match event {
                StreamEvent::Chunk { .. } => {
                    received += 1;
                    if received == 3 {
                        cancel.cancel();
                    }
                }
                StreamEvent::Final { finish, .. } => final_finish = Some(finish),
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(received, 3);
    assert_eq!(final_finish, Some(FinishReason::Cancelled));

    let fresh_cancel = CancelToken::new();
    let resp = adapter.generate(&Request::new("one more time"), &fresh_cancel).unwrap();
    assert_eq!(resp.finish, FinishReason::Length);
}
