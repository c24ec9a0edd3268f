use std::sync::Arc;
use std::time::Duration;

use snare_engine::backend::ExitReason;
use snare_engine::channel::{ChannelEvent, CloseReason, Command, LogLevel, Message};
use snare_engine::{
    Error, HookDescriptor, Instrumenter, Offset, RetryPolicy, Session, SessionState,
};
use test_log::test;

use crate::common::{
    FUNCTION, MODULE, MODULE_BASE, SimBackend, SimProcess, SimTarget, fast_policy, module_code,
    prologue,
};

async fn attach(process: &Arc<SimProcess>) -> Session<SimTarget> {
    let instrumenter = Instrumenter::new(SimBackend::new([process.clone()]));

    let handle = instrumenter
        .find_candidates("game")
        .await
        .unwrap()
        .next()
        .unwrap();

    instrumenter.attach(&handle).await.unwrap()
}

#[test(tokio::test)]
async fn module_polled_until_present() {
    let process = SimProcess::new(1, "game");
    process.load_module(MODULE, MODULE_BASE, module_code(), 2);

    let mut session = attach(&process).await;

    assert!(!session.verify_module_present(MODULE).await.unwrap());
    assert_eq!(session.state(), SessionState::Attached);
    assert!(session.module().is_none());

    assert!(!session.verify_module_present(MODULE).await.unwrap());
    assert!(session.verify_module_present(MODULE).await.unwrap());
    assert_eq!(session.state(), SessionState::Verified);

    let module = session.module().unwrap();
    assert_eq!(module.name(), MODULE);
    assert_eq!(module.base().get(), MODULE_BASE);

    let mut controller = session.load_payload().unwrap();
    assert_eq!(session.state(), SessionState::Active);

    let descriptor = HookDescriptor::new(Offset::new(FUNCTION)).prologue(prologue());
    let handle = session.install(descriptor, |_| ()).await.unwrap();

    assert_eq!(handle.address().address().get(), MODULE_BASE + FUNCTION);

    assert_eq!(
        controller.recv().await,
        Some(ChannelEvent::Message(Message::Ready {
            module: MODULE.to_owned(),
            base: MODULE_BASE,
        }))
    );
    assert_eq!(
        controller.recv().await,
        Some(ChannelEvent::Message(Message::Hooked {
            name: format!("{FUNCTION:#x}"),
            address: MODULE_BASE + FUNCTION,
        }))
    );
}

#[test(tokio::test)]
async fn module_name_match_is_exact() {
    let process = SimProcess::with_game_module(1, "game");
    let session = attach(&process).await;

    assert!(session.resolve_module(MODULE).await.is_ok());

    for name in ["LIBGAME.SO", "libgame", "libgame.so.1"] {
        let err = session.resolve_module(name).await.unwrap_err();
        assert!(matches!(err, Error::ModuleNotFound(n) if n == name));
    }
}

#[test(tokio::test)]
async fn polling_is_bounded_by_timeout() {
    let process = SimProcess::new(1, "game");
    let mut session = attach(&process).await;

    let timeout = Duration::from_millis(300);
    let policy = RetryPolicy::new(u32::MAX, Duration::from_millis(20), timeout);

    let started = tokio::time::Instant::now();
    let err = session.await_module(MODULE, &policy).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::ModuleNotFound(_)));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(150), "{elapsed:?}");

    assert_eq!(session.state(), SessionState::VerifyFailed);

    session.detach().unwrap();
    assert_eq!(session.state(), SessionState::Detached);
    assert!(!process.is_attached());
}

#[test(tokio::test)]
async fn polling_is_bounded_by_attempts() {
    let process = SimProcess::new(1, "game");
    let mut session = attach(&process).await;

    let err = session.await_module(MODULE, &fast_policy(3)).await.unwrap_err();

    assert!(matches!(err, Error::ModuleNotFound(_)));
    assert_eq!(process.module_polls(), 3);
}

#[test(tokio::test)]
async fn operations_out_of_order_are_rejected() {
    let process = SimProcess::with_game_module(1, "game");
    let mut session = attach(&process).await;

    let err = session.load_payload().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: SessionState::Attached,
            ..
        }
    ));

    session.await_module(MODULE, &fast_policy(1)).await.unwrap();

    let descriptor = HookDescriptor::new(Offset::new(FUNCTION)).prologue(prologue());
    let err = session.install(descriptor.clone(), |_| ()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: SessionState::Verified,
            ..
        }
    ));

    let err = session.verify_module_present(MODULE).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    session.detach().unwrap();

    let err = session.install(descriptor, |_| ()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: SessionState::Detached,
            ..
        }
    ));
}

#[test(tokio::test)]
async fn process_exit_closes_channel_once() {
    let process = SimProcess::with_game_module(1, "game");
    let mut session = attach(&process).await;

    session.await_module(MODULE, &fast_policy(1)).await.unwrap();
    let mut controller = session.load_payload().unwrap();

    let descriptor = HookDescriptor::new(Offset::new(FUNCTION)).prologue(prologue());
    let handle = session.install(descriptor, |_| ()).await.unwrap();

    process.kill(3);

    assert_eq!(session.state(), SessionState::Detached);
    assert_eq!(session.exit_reason(), Some(ExitReason::Exited(3)));

    // later operations are no-ops
    session.uninstall(&handle).unwrap();
    session.detach().unwrap();
    session.detach().unwrap();
    drop(session);

    let mut events = Vec::new();
    while let Some(event) = controller.recv().await {
        events.push(event);
    }

    assert!(matches!(
        events.as_slice(),
        [
            ChannelEvent::Message(Message::Ready { .. }),
            ChannelEvent::Message(Message::Hooked { .. }),
            ChannelEvent::Closed(CloseReason::TargetExited(ExitReason::Exited(3))),
        ]
    ));
}

#[test(tokio::test)]
async fn detach_closes_channel_once() {
    let process = SimProcess::with_game_module(1, "game");
    let mut session = attach(&process).await;

    session.await_module(MODULE, &fast_policy(1)).await.unwrap();
    let mut controller = session.load_payload().unwrap();

    let descriptor = HookDescriptor::new(Offset::new(FUNCTION)).prologue(prologue());
    session.install(descriptor, |_| ()).await.unwrap();

    session.detach().unwrap();
    assert_eq!(process.trap_count(), 0);
    assert!(!process.is_attached());

    // the process exiting afterwards doesn't matter anymore
    process.kill(0);
    drop(session);

    let mut events = Vec::new();
    while let Some(event) = controller.recv().await {
        events.push(event);
    }

    assert_eq!(
        events.last(),
        Some(&ChannelEvent::Closed(CloseReason::Detached))
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Closed(_)))
            .count(),
        1
    );
    assert!(events.contains(&ChannelEvent::Message(Message::Unhooked {
        address: MODULE_BASE + FUNCTION,
    })));
}

#[test(tokio::test)]
async fn commands_are_drained() {
    let process = SimProcess::with_game_module(1, "game");
    let mut session = attach(&process).await;

    session.await_module(MODULE, &fast_policy(1)).await.unwrap();
    let mut controller = session.load_payload().unwrap();

    let custom = Command::Custom {
        tag: "reset".to_owned(),
        data: vec![1, 2],
    };

    controller.send(Command::Ping).unwrap();
    controller.send(custom.clone()).unwrap();

    assert_eq!(session.poll_commands(), vec![custom]);
    assert!(session.poll_commands().is_empty());

    assert!(matches!(
        controller.recv().await,
        Some(ChannelEvent::Message(Message::Ready { .. }))
    ));
    assert_eq!(
        controller.recv().await,
        Some(ChannelEvent::Message(Message::log(LogLevel::Debug, "pong")))
    );
}

#[test(tokio::test)]
async fn dropping_the_controller_closes_the_channel() {
    let process = SimProcess::with_game_module(1, "game");
    let mut session = attach(&process).await;

    session.await_module(MODULE, &fast_policy(1)).await.unwrap();
    let controller = session.load_payload().unwrap();

    drop(controller);

    // the session is still usable, notifications are dropped
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.poll_commands().is_empty());

    let descriptor = HookDescriptor::new(Offset::new(FUNCTION)).prologue(prologue());
    assert!(session.install(descriptor, |_| ()).await.is_ok());
}
