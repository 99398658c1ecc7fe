use tokio::sync::watch;

/// A state container with get / set / subscribe.
///
/// Every mutation goes through [`Store::set`] or [`Store::update`], so
/// subscribers always observe whole states, never a half-applied write.
pub struct Store<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Store<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// A clone of the current state.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Reads part of the state without cloning all of it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutates the state in place and notifies subscribers once.
    pub fn update<R: Default>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut out = R::default();
        self.tx.send_modify(|state| out = f(state));
        out
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_updates() {
        let store = Store::new(0u32);
        let mut rx = store.subscribe();
        let seen = store.update(|v| {
            *v += 5;
            *v
        });
        assert_eq!(seen, 5);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 5);
        store.set(9);
        assert_eq!(store.get(), 9);
        assert_eq!(store.read(|v| v * 2), 18);
    }
}
