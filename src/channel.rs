use crate::error::SignalingError;
use crate::peer::transport::EstablishedChannel;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Метаданные установленного канала
#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    /// Идентификатор соединения, пришедший от пира
    pub peer_token: String,
    /// Короткий отпечаток удалённого описания
    pub fingerprint: String,
    pub established_at: DateTime<Utc>,
}

/// Надёжный упорядоченный двунаправленный байтовый канал.
///
/// Отдаётся ровно один раз после установки соединения. Освобождение
/// гарантировано на любом пути выхода: явный `close`, drop хэндла или
/// закрытие линка снизу. После освобождения чтение и запись отвечают
/// `ChannelClosed`.
#[derive(Debug)]
pub struct ChannelHandle {
    metadata: ChannelMetadata,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl ChannelHandle {
    pub(crate) fn new(parts: EstablishedChannel, metadata: ChannelMetadata) -> Self {
        Self {
            metadata,
            outbound: parts.outbound,
            inbound: parts.inbound,
            shutdown: parts.shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn metadata(&self) -> &ChannelMetadata {
        &self.metadata
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send(&mut self, data: Bytes) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed);
        }
        self.outbound.send(data).map_err(|_| {
            // пир закрыл линк раньше нас
            self.mark_closed();
            SignalingError::ChannelClosed
        })
    }

    pub async fn recv(&mut self) -> Result<Bytes, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed);
        }
        match self.inbound.recv().await {
            Some(data) => Ok(data),
            None => {
                self.mark_closed();
                Err(SignalingError::ChannelClosed)
            }
        }
    }

    /// Идемпотентное закрытие: линк снизу закрывается один раз
    pub async fn close(&mut self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "signaling", peer = %self.metadata.peer_token, "channel released");
            self.shutdown.notify_one();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_pair() -> (
        ChannelHandle,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedSender<Bytes>,
        Arc<Notify>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let handle = ChannelHandle::new(
            EstablishedChannel {
                outbound: out_tx,
                inbound: in_rx,
                shutdown: shutdown.clone(),
            },
            ChannelMetadata {
                peer_token: "aabbccdd00112233".into(),
                fingerprint: "deadbeefcafe".into(),
                established_at: Utc::now(),
            },
        );
        (handle, out_rx, in_tx, shutdown)
    }

    #[tokio::test]
    async fn bytes_pass_both_ways() {
        let (mut handle, mut out_rx, in_tx, _shutdown) = handle_pair();

        handle.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from_static(b"ping"));

        in_tx.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(handle.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let (mut handle, _out_rx, in_tx, shutdown) = handle_pair();

        handle.close().await;
        handle.close().await; // повторное закрытие — no-op

        assert!(matches!(
            handle.send(Bytes::from_static(b"x")).await,
            Err(SignalingError::ChannelClosed)
        ));
        assert!(matches!(
            handle.recv().await,
            Err(SignalingError::ChannelClosed)
        ));
        // сигнал закрытия дошёл до транспорта
        tokio::time::timeout(std::time::Duration::from_millis(50), shutdown.notified())
            .await
            .unwrap();
        drop(in_tx);
    }

    #[tokio::test]
    async fn drop_releases_link() {
        let (handle, mut out_rx, _in_tx, shutdown) = handle_pair();
        drop(handle);
        tokio::time::timeout(std::time::Duration::from_millis(50), shutdown.notified())
            .await
            .unwrap();
        // отправитель уничтожен вместе с хэндлом
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_side_teardown_surfaces_as_channel_closed() {
        let (mut handle, _out_rx, in_tx, _shutdown) = handle_pair();
        drop(in_tx);
        assert!(matches!(
            handle.recv().await,
            Err(SignalingError::ChannelClosed)
        ));
        assert!(handle.is_closed());
    }
}
