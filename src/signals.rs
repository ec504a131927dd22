//! Process-wide termination requests.

use std::future::Future;

use tracing::warn;

/// Which termination request arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl-C / SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP, sent when the controlling terminal goes away.
    Hangup,
    /// SIGQUIT.
    Quit,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        }
    }
}

/// Installs the handlers and returns a future that resolves on the first
/// termination request.
///
/// Handlers are registered before this returns, so a signal arriving while the
/// batch is being submitted is not lost to its default action. Children live in
/// their own process groups, so a hangup that killed parrun outright would
/// leave them orphaned. Must be called inside a tokio runtime.
pub fn shutdown_signal() -> impl Future<Output = ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        let terminate = listen(SignalKind::terminate(), ShutdownSignal::Terminate);
        let hangup = listen(SignalKind::hangup(), ShutdownSignal::Hangup);
        let quit = listen(SignalKind::quit(), ShutdownSignal::Quit);
        async move {
            tokio::select! {
                signal = ctrl_c() => signal,
                signal = terminate => signal,
                signal = hangup => signal,
                signal = quit => signal,
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c()
    }
}

/// Registers `kind` now and resolves to `reported` when it is delivered.
#[cfg(unix)]
fn listen(
    kind: tokio::signal::unix::SignalKind,
    reported: ShutdownSignal,
) -> impl Future<Output = ShutdownSignal> {
    let stream = tokio::signal::unix::signal(kind);
    async move {
        match stream {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(signal = reported.label(), error = %err, "cannot listen for signal");
                std::future::pending::<()>().await;
            }
        }
        reported
    }
}

async fn ctrl_c() -> ShutdownSignal {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C");
        // without a handler the only way out is the batch finishing
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}
