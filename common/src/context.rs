use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// Contexto cancelable con jerarquía: cancelar un padre cancela a todos sus hijos,
/// cancelar un hijo no afecta al padre.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<Context>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    pub fn background() -> Self {
        let (tx, _rx) = watch::channel(false);
        Context {
            inner: Arc::new(Inner { tx, parent: None }),
        }
    }

    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Context {
            inner: Arc::new(Inner {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(|p| p.is_cancelled())
    }

    /// Se resuelve cuando este contexto o algún ancestro se cancela.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let rx = self.inner.tx.subscribe();
            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = wait_true(rx) => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => wait_true(rx).await,
            }
        })
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // sin emisor nunca llegará la cancelación
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn parent_cancels_children() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.child();
        root.cancel();
        assert!(grandchild.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), grandchild.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn child_does_not_cancel_parent() {
        let root = Context::background();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(50), root.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let ctx = Context::background();
        ctx.cancel();
        tokio::time::timeout(Duration::from_millis(50), ctx.cancelled())
            .await
            .unwrap();
    }
}
