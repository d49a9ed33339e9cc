//! End-to-end behavior of bridged targets: plain and async calls, generator
//! sessions, transfers, abandonment and transport failure.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;

use offrpc::Buffer;
use offrpc::Invoke;
use offrpc::Message;
use offrpc::Port;
use offrpc::Reply;
use offrpc::RequestId;
use offrpc::Step;
use offrun::Abrupt;
use offrun::CallError;
use offrun::Channel;
use offrun::DuplexChannel;
use offrun::Options;
use offrun::StreamGenerator;
use offrun::Target;
use offrun::TargetKind;
use offrun::Thrown;
use offrun::TransferSet;
use offrun::TransportError;
use offrun::Value;
use offrun::bridge;
use offrun::connect;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(name: &str) -> Options {
    init_tracing();
    Options::default().with_name(name)
}

fn echo_after_delay() -> Target {
    Target::asynchronous(|args| async move {
        let ms = args.get(1).and_then(Value::as_f64).unwrap_or(0.0) as u64;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(args.into_iter().next().unwrap_or_default())
    })
}

/// Yields 3, 1, 4 and returns 1.
fn three_one_four() -> Target {
    Target::coroutine(|_args, co| async move {
        co.yield_(3).await?;
        co.yield_(1).await?;
        co.yield_(4).await?;
        Ok::<_, Abrupt>(Value::from(1))
    })
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_plain_round_trip() -> anyhow::Result<()> {
    let remote = bridge(
        Target::plain(|args| Ok(Value::from(format!("foo: {}", args[0].to_text())))),
        options("plain"),
    );
    assert_eq!(remote.kind(), TargetKind::Plain);
    assert_eq!(remote.call(vec!["test".into()]).await?, Value::from("foo: test"));
    Ok(())
}

#[tokio::test]
async fn test_arguments_arrive_in_order() -> anyhow::Result<()> {
    let remote = bridge(Target::plain(|args| Ok(Value::Array(args))), options("args"));
    let args = vec![Value::from(1), Value::from("two"), Value::Null, Value::Undefined, Value::from(true)];
    assert_eq!(remote.call(args.clone()).await?, Value::Array(args));
    Ok(())
}

#[tokio::test]
async fn test_thrown_error_keeps_its_text() {
    let remote = bridge(
        Target::plain(|args| Err(Thrown::msg(format!("Error: cannot handle {}", args[0].to_text())))),
        options("throws"),
    );
    let err = remote.call(vec![5.into()]).await.unwrap_err();
    assert_eq!(err, CallError::Remote("Error: cannot handle 5".into()));
    assert_eq!(err.to_string(), "Error: cannot handle 5");
}

#[tokio::test]
async fn test_async_rejection_and_panic() {
    let remote = bridge(
        Target::asynchronous(|args| async move {
            match args[0].as_str() {
                Some("panic") => panic!("async boom"),
                _ => Err::<Value, _>(Thrown::from(Value::from(404))),
            }
        }),
        options("rejects"),
    );
    assert_eq!(remote.call(vec!["x".into()]).await, Err(CallError::Remote("404".into())));
    assert_eq!(remote.call(vec!["panic".into()]).await, Err(CallError::Remote("panic: async boom".into())));
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() -> anyhow::Result<()> {
    let remote = bridge(echo_after_delay(), options("concurrent"));

    let mut rng = rand::thread_rng();
    let calls = (0..64).map(|i| {
        let delay: u32 = rng.gen_range(0..20);
        let remote = remote.clone();
        async move { (i, remote.call(vec![i.into(), delay.into()]).await) }
    });

    let results = futures::future::join_all(calls).await;
    for (i, result) in results {
        assert_eq!(result?, Value::from(i));
    }
    assert_eq!(remote.caller().pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_completion_follows_reply_order() {
    let remote = bridge(echo_after_delay(), options("ordering"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for (label, delay) in [("slow", 120), ("fast", 0)] {
        let remote = remote.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = remote.call(vec![label.into(), delay.into()]).await;
            let _ = tx.send(result);
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(rx.recv().await, Some(Ok(Value::from("fast"))));
    assert_eq!(rx.recv().await, Some(Ok(Value::from("slow"))));
}

#[tokio::test]
async fn test_abandoned_call_does_not_disturb_others() -> anyhow::Result<()> {
    let remote = bridge(echo_after_delay(), options("abandon"));

    let timed_out = tokio::time::timeout(Duration::from_millis(10), remote.call(vec!["late".into(), 100.into()])).await;
    assert!(timed_out.is_err());
    assert_eq!(remote.caller().pending_count(), 0);

    // the late reply arrives while this call is outstanding and is dropped
    let value = remote.call(vec!["on time".into(), 150.into()]).await?;
    assert_eq!(value, Value::from("on time"));
    Ok(())
}

#[tokio::test]
async fn test_kind_mismatch_is_reported_locally() {
    let plain = bridge(Target::plain(|_| Ok(Value::Null)), options("plain-kind"));
    assert!(matches!(
        plain.session(vec![]),
        Err(CallError::KindMismatch { expected: TargetKind::Generator, found: TargetKind::Plain })
    ));

    let generator = bridge(three_one_four(), options("generator-kind"));
    assert!(matches!(generator.call(vec![]).await, Err(CallError::KindMismatch { .. })));
}

// ============================================================================
//  GENERATOR SESSIONS
// ============================================================================

#[tokio::test]
async fn test_generator_yields_then_returns() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen"));
    let mut session = remote.session(vec![])?;

    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(3));
    assert!(session.id().is_some());
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(1));
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(4));
    assert_eq!(session.next(Value::Undefined).await?, Step::done(1));
    assert!(session.is_completed());
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    Ok(())
}

#[tokio::test]
async fn test_early_return_completes_the_session() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen-return"));
    let mut session = remote.session(vec![])?;

    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(3));
    assert_eq!(session.return_with(7).await?, Step::done(7));
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    assert_eq!(session.return_with(8).await?, Step::done(8));

    let err = session.throw("Error: after the end").await.unwrap_err();
    assert_eq!(err, CallError::Remote("Error: after the end".into()));
    Ok(())
}

#[tokio::test]
async fn test_throw_at_a_yield_rejects() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen-throw"));
    let mut session = remote.session(vec![])?;

    session.next(Value::Undefined).await?;
    let err = session.throw("Error: stop").await.unwrap_err();
    assert_eq!(err, CallError::Remote("Error: stop".into()));
    assert!(session.is_completed());
    Ok(())
}

#[tokio::test]
async fn test_next_values_reach_the_body() -> anyhow::Result<()> {
    let remote = bridge(
        Target::coroutine(|args, co| async move {
            let base = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            let mut total = base;
            loop {
                let input = co.yield_(total).await?;
                match input.as_f64() {
                    Some(n) => total += n,
                    None => break,
                }
            }
            Ok::<_, Abrupt>(Value::from(total))
        }),
        options("gen-input"),
    );

    let mut session = remote.session(vec![10.into()])?;
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(10));
    assert_eq!(session.next(5).await?, Step::yielded(15));
    assert_eq!(session.next(2).await?, Step::yielded(17));
    assert_eq!(session.next(Value::Null).await?, Step::done(17));
    Ok(())
}

#[tokio::test]
async fn test_empty_generator_behaves_like_a_finished_one() -> anyhow::Result<()> {
    let remote = bridge(Target::coroutine(|_args, _co| async move { Ok::<_, Abrupt>(Value::Undefined) }), options("no-g"));

    let mut session = remote.session(vec![])?;
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    assert_eq!(session.next(2).await?, Step::done(Value::Undefined));
    assert!(session.throw("Error: x").await.is_err());
    assert_eq!(session.return_with(Value::Undefined).await?, Step::done(Value::Undefined));
    assert!(session.throw("Error: y").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_return_before_first_next_skips_the_body() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen-unstarted"));
    let mut session = remote.session(vec![])?;

    assert_eq!(session.return_with(5).await?, Step::done(5));
    assert!(session.is_completed());
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    Ok(())
}

#[tokio::test]
async fn test_generator_error_rejects_the_step() -> anyhow::Result<()> {
    let remote = bridge(
        Target::coroutine(|_args, co| async move {
            co.yield_("first").await?;
            Err::<Value, _>(Abrupt::from(Thrown::msg("Error: generator broke")))
        }),
        options("gen-error"),
    );
    let mut session = remote.session(vec![])?;
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded("first"));
    assert_eq!(session.next(Value::Undefined).await, Err(CallError::Remote("Error: generator broke".into())));
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_independent() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen-many"));
    let mut a = remote.session(vec![])?;
    let mut b = remote.session(vec![])?;

    assert_eq!(a.next(Value::Undefined).await?, Step::yielded(3));
    assert_eq!(a.next(Value::Undefined).await?, Step::yielded(1));
    assert_eq!(b.next(Value::Undefined).await?, Step::yielded(3));
    assert_ne!(a.id(), b.id());
    Ok(())
}

#[tokio::test]
async fn test_session_iterates_as_a_stream() -> anyhow::Result<()> {
    let remote = bridge(three_one_four(), options("gen-stream"));
    let values: Vec<Value> = remote
        .session(vec![])?
        .into_stream()
        .map(|item| item.expect("step"))
        .collect()
        .await;
    assert_eq!(values, vec![Value::from(3), Value::from(1), Value::from(4)]);
    Ok(())
}

#[tokio::test]
async fn test_stream_backed_target() -> anyhow::Result<()> {
    let remote = bridge(
        Target::generator(|args| StreamGenerator::from_values(args.into_iter().rev().collect::<Vec<_>>())),
        options("gen-stream-target"),
    );
    let mut session = remote.session(vec!["a".into(), "b".into()])?;
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded("b"));
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded("a"));
    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    Ok(())
}

/// Sets its flag when dropped, i.e. when the body holding it ends.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Takes 300ms to reach its first yield; `released` is set once the body ends.
fn slow_to_yield(released: Arc<AtomicBool>) -> Target {
    Target::coroutine(move |_args, co| {
        let flag = DropFlag(released.clone());
        async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_millis(300)).await;
            co.yield_(1).await?;
            co.yield_(2).await?;
            Ok::<_, Abrupt>(Value::Undefined)
        }
    })
}

async fn becomes_set(flag: &AtomicBool) -> bool {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_dropping_a_session_mid_step_releases_the_generator() -> anyhow::Result<()> {
    let released = Arc::new(AtomicBool::new(false));
    let remote = bridge(slow_to_yield(released.clone()), options("gen-cancel"));
    let mut session = remote.session(vec![])?;

    let step = tokio::time::timeout(Duration::from_millis(50), session.next(Value::Undefined)).await;
    assert!(step.is_err(), "the step should still be in flight");
    assert!(session.id().is_some());
    assert!(!released.load(Ordering::SeqCst));

    drop(session);
    assert!(becomes_set(&released).await, "generator was never released");
    Ok(())
}

#[tokio::test]
async fn test_step_after_a_dropped_step_fails_and_releases() -> anyhow::Result<()> {
    let released = Arc::new(AtomicBool::new(false));
    let remote = bridge(slow_to_yield(released.clone()), options("gen-cancel-next"));
    let mut session = remote.session(vec![])?;

    let step = tokio::time::timeout(Duration::from_millis(50), session.next(Value::Undefined)).await;
    assert!(step.is_err(), "the step should still be in flight");

    let err = session.next(Value::Undefined).await.unwrap_err();
    assert!(matches!(err, CallError::Protocol(_)), "got {:?}", err);
    assert!(session.is_completed());
    assert!(becomes_set(&released).await, "generator was never released");

    assert_eq!(session.next(Value::Undefined).await?, Step::done(Value::Undefined));
    Ok(())
}

// ============================================================================
//  TRANSFERS
// ============================================================================

fn echo_first() -> Target {
    Target::plain(|args| Ok(args.into_iter().next().unwrap_or_default()))
}

#[tokio::test]
async fn test_transferred_buffer_is_not_copied() -> anyhow::Result<()> {
    let remote = bridge(echo_first(), options("transfer"));
    let buf = Buffer::new(vec![9u8; 1 << 16]);

    let Value::Buffer(back) = remote.call(vec![Value::Buffer(buf.clone())]).await? else {
        panic!("expected a buffer back");
    };
    assert!(back.shares_storage(&buf));
    Ok(())
}

#[tokio::test]
async fn test_without_detection_buffers_are_copied() -> anyhow::Result<()> {
    let remote = bridge(echo_first(), options("copy").with_transfer_detection(false));
    let buf = Buffer::new(vec![9u8; 1 << 16]);

    let Value::Buffer(back) = remote.call(vec![Value::Buffer(buf.clone())]).await? else {
        panic!("expected a buffer back");
    };
    assert_eq!(back, buf);
    assert!(!back.shares_storage(&buf));
    Ok(())
}

#[tokio::test]
async fn test_port_moves_only_by_transfer() -> anyhow::Result<()> {
    let target = || {
        Target::plain(|args| match &args[0] {
            Value::Port(port) => Ok(Value::Bool(port.post("hello".into()))),
            other => Err(Thrown::msg(format!("Error: expected a port, got {:?}", other.kind()))),
        })
    };

    let (port, mine) = Port::pair();
    let remote = bridge(target(), options("port"));
    assert_eq!(remote.call(vec![Value::Port(port)]).await?, Value::Bool(true));
    assert_eq!(mine.try_recv(), Some(Value::from("hello")));

    let (port, _mine) = Port::pair();
    let remote = bridge(target(), options("port-copy").with_transfer_detection(false));
    let err = remote.call(vec![Value::Port(port)]).await.unwrap_err();
    assert!(matches!(err, CallError::Transport(TransportError::Codec(_))), "got {:?}", err);
    Ok(())
}

// ============================================================================
//  CONNECTION FAILURES (raw far end)
// ============================================================================

async fn next_invoke(far: &DuplexChannel) -> Invoke {
    match far.recv().await.expect("recv") {
        Some(Message::Invoke(invoke)) => invoke,
        other => panic!("expected invoke, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_reply_is_ignored() -> anyhow::Result<()> {
    let (near, far) = DuplexChannel::pair();
    let remote = connect(Box::new(near), TargetKind::Plain, options("raw-unknown"));

    let call = tokio::spawn({
        let remote = remote.clone();
        async move { remote.call(vec!["x".into()]).await }
    });

    let invoke = next_invoke(&far).await;
    far.send(Reply::ok(RequestId(9999), Value::Null).into(), TransferSet::empty()).await?;
    far.send(Reply::ok(invoke.request, "real".into()).into(), TransferSet::empty()).await?;

    assert_eq!(call.await?, Ok(Value::from("real")));
    Ok(())
}

#[tokio::test]
async fn test_connection_loss_rejects_pending_calls() -> anyhow::Result<()> {
    let (near, far) = DuplexChannel::pair();
    let remote = connect(Box::new(near), TargetKind::Async, options("raw-loss"));

    let call = tokio::spawn({
        let remote = remote.clone();
        async move { remote.call(vec![]).await }
    });

    next_invoke(&far).await;
    far.close();

    let err = call.await?.unwrap_err();
    assert!(matches!(err, CallError::Transport(TransportError::ConnectionLost(_))), "got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_bad_open_acknowledgment_is_a_protocol_error() -> anyhow::Result<()> {
    let (near, far) = DuplexChannel::pair();
    let remote = connect(Box::new(near), TargetKind::Generator, options("raw-ack"));

    let step = tokio::spawn({
        let remote = remote.clone();
        async move {
            match remote.session(vec![]) {
                Ok(mut session) => session.next(Value::Undefined).await,
                Err(e) => Err(e),
            }
        }
    });

    let open = next_invoke(&far).await;
    assert!(open.session.is_some());
    far.send(Reply::ok(open.request, Step::yielded(1).into_value()).into(), TransferSet::empty()).await?;

    assert!(matches!(step.await?, Err(CallError::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn test_dropping_the_last_handle_stops_the_executor() -> anyhow::Result<()> {
    let (near, far) = DuplexChannel::pair();
    let executor = offrun::Executor::new(three_one_four(), &options("shutdown"));
    let served = tokio::spawn(executor.serve(Box::new(far)));

    let remote = connect(Box::new(near), TargetKind::Generator, options("shutdown"));
    let mut session = remote.session(vec![])?;
    assert_eq!(session.next(Value::Undefined).await?, Step::yielded(3));
    drop(session);
    drop(remote);

    tokio::time::timeout(Duration::from_secs(5), served).await???;
    Ok(())
}

#[tokio::test]
async fn test_calls_after_connection_loss_fail_fast() -> anyhow::Result<()> {
    let (near, far) = DuplexChannel::pair();
    let remote = connect(Box::new(near), TargetKind::Plain, options("raw-closed"));
    far.close();

    for _ in 0..2 {
        let outcome = tokio::time::timeout(Duration::from_secs(1), remote.call(vec![])).await?;
        let err = outcome.unwrap_err();
        assert!(matches!(err, CallError::Transport(TransportError::ConnectionLost(_))), "got {:?}", err);
    }
    Ok(())
}
