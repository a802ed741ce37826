#[cfg(unix)]
#[path = "signals/unix.rs"]
mod platform;

#[cfg(target_os = "windows")]
#[path = "signals/windows.rs"]
mod platform;

pub use platform::Terminate;

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt as _, channel::mpsc};
    use std::time::Duration;

    #[tokio::test]
    async fn channel_backed_terminate_fires_on_send() {
        let (mut tx, rx) = mpsc::channel(1);
        let mut terminate = Terminate::from_channel(rx);

        assert!(
            tokio::time::timeout(Duration::from_millis(50), terminate.recv())
                .await
                .is_err(),
            "Should not fire before anything was sent"
        );

        tx.send(()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), terminate.recv())
            .await
            .unwrap();
    }
}
