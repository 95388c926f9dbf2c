//! Transaction epoch selection and pool map version checks.

use super::*;

/// Outcome of asking for the epoch to run an I/O at.
#[derive(Debug)]
pub enum EpochGrant {
    /// The epoch is known.
    Chosen(Epoch),

    /// No epoch yet: the caller runs its I/O without one and must report
    /// the server-assigned epoch through the chooser.
    Choosing(EpochChooser),
}

/// Token held by the single in-flight I/O that chooses the transaction
/// epoch. Dropping it unfinished lets another I/O take over.
#[derive(Debug)]
pub struct EpochChooser {
    tx: TxHandle,
    gen: u64,
    done: bool,
}

impl EpochChooser {
    /// Reports the outcome of the epoch-choosing I/O. A `TxRestart` outcome
    /// fails the transaction; a successful one adopts `epoch` if no epoch
    /// was chosen meanwhile.
    pub fn complete(
        mut self,
        status: ErrCode,
        epoch: u64,
    ) -> Result<(), ShardTxError> {
        self.done = true;
        let mut st = self.tx.state();
        let res = self.tx.epoch_io_done(&mut st, status);
        if st.chooser == Some(self.gen) {
            st.chooser = None;
        }

        let res = res.and_then(|_| {
            if status != ErrCode::Success || st.epoch.is_chosen() {
                return Ok(());
            }
            if epoch == u64::MAX {
                return logged_err!(ErrCode::Proto;
                                   "server returned invalid epoch {}", epoch);
            }
            if epoch != 0 {
                st.epoch.value = epoch;
                if st.epoch.first == 0 {
                    st.epoch.first = epoch;
                }
                pf_debug!("tx {:?} chose epoch {}", st.xid, epoch);
            }
            Ok(())
        });

        self.tx.notify_epoch_waiters(&mut st);
        res
    }
}

impl Drop for EpochChooser {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut st = self.tx.state();
        if st.chooser == Some(self.gen) {
            st.chooser = None;
            self.tx.notify_epoch_waiters(&mut st);
        }
    }
}

impl TxHandle {
    /// Returns the epoch for the next I/O of the transaction. If no epoch
    /// has been chosen, the first caller gets a chooser and later callers
    /// wait until it completes.
    pub async fn io_epoch(&self) -> Result<EpochGrant, ShardTxError> {
        let mut rx = self.0.epoch_tx.subscribe();
        loop {
            {
                let mut st = self.state();
                if st.closed {
                    return Err(ShardTxError::code(
                        ErrCode::NoHdl,
                        "tx closed",
                    ));
                }
                match st.status {
                    TxStatus::Failed => {
                        return Err(ShardTxError::code(
                            ErrCode::Canceled,
                            "tx failed, restart required",
                        ))
                    }
                    TxStatus::Aborted | TxStatus::Committed => {
                        return Err(ShardTxError::code(
                            ErrCode::NoPerm,
                            format!("no I/O in status {}", st.status),
                        ))
                    }
                    _ => {}
                }

                if st.epoch.is_chosen() {
                    return Ok(EpochGrant::Chosen(st.epoch));
                }
                if st.chooser.is_none() {
                    st.chooser_gen += 1;
                    let gen = st.chooser_gen;
                    st.chooser = Some(gen);
                    return Ok(EpochGrant::Choosing(EpochChooser {
                        tx: self.clone(),
                        gen,
                        done: false,
                    }));
                }
                rx.borrow_and_update();
            }

            if rx.changed().await.is_err() {
                return Err(ShardTxError::code(
                    ErrCode::Canceled,
                    "epoch notifier gone",
                ));
            }
        }
    }

    /// Records the outcome of any I/O run under the transaction: a
    /// `TxRestart` outcome marks it failed.
    pub(super) fn epoch_io_done(
        &self,
        st: &mut TxState,
        status: ErrCode,
    ) -> Result<(), ShardTxError> {
        if status == ErrCode::TxRestart {
            if st.status != TxStatus::Aborted {
                st.status = TxStatus::Failed;
            }
            return Err(ShardTxError::code(
                ErrCode::TxRestart,
                "I/O requires tx restart",
            ));
        }
        Ok(())
    }

    /// Binds the transaction to the locally known pool map version on first
    /// use. Once bound, a newer map fails a read-write transaction, which
    /// must be restarted.
    pub fn check_pool_map(&self) -> Result<(), ShardTxError> {
        let current = self.0.cont.pool().map().current_version();
        let mut st = self.state();
        Self::check_pool_map_locked(&mut st, current)
    }

    pub(super) fn check_pool_map_locked(
        st: &mut TxState,
        current: MapVersion,
    ) -> Result<(), ShardTxError> {
        if st.pm_ver == 0 {
            st.pm_ver = current;
            return Ok(());
        }
        if current > st.pm_ver && !st.flags.contains(TxFlags::RDONLY) {
            pf_info!(
                "tx {:?} pool map {} -> {}, restart needed",
                st.xid,
                st.pm_ver,
                current
            );
            st.status = TxStatus::Failed;
            return Err(ShardTxError::code(
                ErrCode::TxRestart,
                format!("pool map advanced past {}", st.pm_ver),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod epoch_tests {
    use super::*;
    use crate::txn::txn_tests::setup;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_chooser() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;

        let chooser = match tx.io_epoch().await? {
            EpochGrant::Choosing(c) => c,
            grant => panic!("unexpected grant {:?}", grant),
        };
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.io_epoch().await })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        chooser.complete(ErrCode::Success, 77)?;
        match waiter.await?? {
            EpochGrant::Chosen(e) => {
                assert_eq!(e.value, 77);
                assert_eq!(e.first, 77);
            }
            grant => panic!("unexpected grant {:?}", grant),
        }
        assert_eq!(tx.epoch()?, 77);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_chooser_hands_over() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        let chooser = tx.io_epoch().await?;
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.io_epoch().await })
        };
        time::sleep(Duration::from_millis(20)).await;
        drop(chooser);
        assert!(matches!(waiter.await??, EpochGrant::Choosing(_)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chooser_failures() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        if let EpochGrant::Choosing(c) = tx.io_epoch().await? {
            let err = c.complete(ErrCode::Success, u64::MAX).unwrap_err();
            assert_eq!(err.errcode(), ErrCode::Proto);
        }
        assert!(tx.epoch().is_err());

        if let EpochGrant::Choosing(c) = tx.io_epoch().await? {
            let err = c.complete(ErrCode::TxRestart, 0).unwrap_err();
            assert_eq!(err.errcode(), ErrCode::TxRestart);
        }
        assert_eq!(tx.status(), TxStatus::Failed);
        let err = tx.io_epoch().await.unwrap_err();
        assert_eq!(err.errcode(), ErrCode::Canceled);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fixed_epoch_granted() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open_snapshot(&cont, 9)?;
        match tx.io_epoch().await? {
            EpochGrant::Chosen(e) => assert_eq!(e.value, 9),
            grant => panic!("unexpected grant {:?}", grant),
        }
        Ok(())
    }

    #[test]
    fn pool_map_check() -> Result<(), ShardTxError> {
        let (sim, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        tx.check_pool_map()?;
        assert_eq!(tx.map_version(), 1);
        tx.check_pool_map()?;

        let snap = TxHandle::open_snapshot(&cont, 5)?;
        snap.check_pool_map()?;

        sim.bump_version(&[]);
        sim.refresh_now();
        let err = tx.check_pool_map().unwrap_err();
        assert_eq!(err.errcode(), ErrCode::TxRestart);
        assert_eq!(tx.status(), TxStatus::Failed);
        snap.check_pool_map()?;
        Ok(())
    }
}
