//! Lazily filled connection slot shared by concurrent queries
//!
//! Every connection placed in the slot gets a fresh generation number. A query
//! that fails discards the connection only if the slot still holds the
//! generation it leased, so a late failure on an old connection cannot close
//! a replacement another query already installed.

use std::future::Future;

use tokio::sync::Mutex;

use crate::dns::error::DnsResult;

/// A connection handed out by [`ConnSlot::acquire`]
#[derive(Debug, Clone)]
pub(crate) struct Lease<T> {
    /// Generation of the slot entry this connection came from
    pub generation: u64,
    /// The connection itself
    pub conn: T,
    /// True when an existing connection was reused
    pub reused: bool,
}

#[derive(Debug)]
struct State<T> {
    next: u64,
    current: Option<(u64, T)>,
}

/// Mutex-guarded optional connection with generation tracking
#[derive(Debug)]
pub(crate) struct ConnSlot<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone> ConnSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next: 1,
                current: None,
            }),
        }
    }

    /// Return the current connection, or open one with `connect`
    ///
    /// An entry for which `usable` returns false is replaced. The lock is held
    /// across `connect`, so concurrent callers wait for one setup.
    ///
    /// # Errors
    ///
    /// Propagates the error from `connect`; the slot is left empty.
    pub(crate) async fn acquire<U, F, Fut>(&self, usable: U, connect: F) -> DnsResult<Lease<T>>
    where
        U: FnOnce(&T) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DnsResult<T>>,
    {
        let mut state = self.state.lock().await;
        if let Some((generation, conn)) = state.current.as_ref() {
            if usable(conn) {
                return Ok(Lease {
                    generation: *generation,
                    conn: conn.clone(),
                    reused: true,
                });
            }
        }
        state.current = None;

        let conn = connect().await?;
        let generation = state.next;
        state.next += 1;
        state.current = Some((generation, conn.clone()));
        Ok(Lease {
            generation,
            conn,
            reused: false,
        })
    }

    /// Remove the connection if it is still the one of `generation`
    pub(crate) async fn discard(&self, generation: u64) -> Option<T> {
        let mut state = self.state.lock().await;
        match state.current.as_ref() {
            Some((current, _)) if *current == generation => state.current.take().map(|(_, conn)| conn),
            _ => None,
        }
    }

    /// Remove whatever connection is present
    pub(crate) async fn take(&self) -> Option<T> {
        self.state.lock().await.current.take().map(|(_, conn)| conn)
    }

    /// Generation of the current connection, if any
    pub(crate) async fn current_generation(&self) -> Option<u64> {
        self.state.lock().await.current.as_ref().map(|(generation, _)| *generation)
    }
}
