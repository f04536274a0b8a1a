use std::{cell::Cell, thread::LocalKey};

/// Per-thread "already inside" flag. Interceptors take it before doing any
/// work of their own, so a hooked call made by that work (or by the log sink)
/// passes straight through.
pub struct ReentryToken {
    active: &'static LocalKey<Cell<bool>>,
}

impl ReentryToken {
    #[doc(hidden)]
    pub const fn new(active: &'static LocalKey<Cell<bool>>) -> ReentryToken {
        Self { active }
    }

    pub fn try_enter(&self) -> Option<ReentryGuard> {
        // Thread teardown: behave as if already inside.
        let entered = self
            .active
            .try_with(|active| !active.replace(true))
            .unwrap_or(false);
        entered.then(|| ReentryGuard(self.active))
    }
}

pub struct ReentryGuard(&'static LocalKey<Cell<bool>>);

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = self.0.try_with(|active| active.set(false));
    }
}

macro_rules! reentry_token {
    ($name:ident) => {
        static $name: $crate::reentry::ReentryToken = {
            ::std::thread_local! { static ACTIVE: ::core::cell::Cell<bool> = const { ::core::cell::Cell::new(false) } }
            $crate::reentry::ReentryToken::new(&ACTIVE)
        };
    };
}

pub(crate) use reentry_token;
