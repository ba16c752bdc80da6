//! Call Timing
//!
//! Measures how long a call takes and writes one metric per call through the
//! configured backends:
//!
//! ```text
//! { <duration_field>: ms, hostname, origin?, ...hook metadata }  named by FQN
//! ```
//!
//! Hooks run after the call, in order: the settings' hooks first, then any
//! extra hooks passed for this call site. Each hook sees the base metric, the
//! call's response and error, and may return extra fields to merge in. A hook
//! may also be entered when the call starts ([`entry_hook`]); its guard then
//! produces the fields at exit. A panicking hook is skipped.
//!
//! A call that unwinds is still recorded, with [`CALL_PANICKED`] as its error.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;
use tracing::{warn, Instrument};

use crate::observability::timed_span;
use crate::record::{FieldValue, Fields};
use crate::settings::{Settings, SettingsHandle};

/// What a hook gets to look at
pub struct HookContext<'a> {
    /// Fully-qualified name of the call site
    pub fqn: &'a str,
    /// The base metric, before any hook metadata is merged
    pub metric: &'a Fields,
    /// The call's return value, when it was captured
    pub response: Option<&'a (dyn Any + Send)>,
    /// The call's error, rendered
    pub error: Option<&'a str>,
}

impl HookContext<'_> {
    /// Downcast the response to a concrete type
    pub fn response<T: Any>(&self) -> Option<&T> {
        self.response.and_then(|r| r.downcast_ref::<T>())
    }
}

/// Enrichment callback; returned fields are merged into the metric
pub trait Hook: Send + Sync {
    /// Run once the call completed
    fn call(&self, ctx: &HookContext<'_>) -> Option<Fields>;

    /// Run when the call starts.
    ///
    /// A returned guard carries per-call state and finishes the hook for this
    /// call in place of [`Hook::call`].
    fn enter(&self, _fqn: &str) -> Option<Box<dyn HookGuard>> {
        None
    }
}

impl<F> Hook for F
where
    F: Fn(&HookContext<'_>) -> Option<Fields> + Send + Sync,
{
    fn call(&self, ctx: &HookContext<'_>) -> Option<Fields> {
        self(ctx)
    }
}

pub type SharedHook = Arc<dyn Hook>;

/// Per-call state of a hook entered at call start
pub trait HookGuard: Send {
    fn exit(self: Box<Self>, ctx: &HookContext<'_>) -> Option<Fields>;
}

impl<F> HookGuard for F
where
    F: FnOnce(&HookContext<'_>) -> Option<Fields> + Send,
{
    fn exit(self: Box<Self>, ctx: &HookContext<'_>) -> Option<Fields> {
        (*self)(ctx)
    }
}

/// Hook that runs at call entry and again at exit, built by [`entry_hook`]
pub struct EntryHook<F>(F);

impl<F, G> Hook for EntryHook<F>
where
    F: Fn(&str) -> G + Send + Sync,
    G: HookGuard + 'static,
{
    fn call(&self, _ctx: &HookContext<'_>) -> Option<Fields> {
        None
    }

    fn enter(&self, fqn: &str) -> Option<Box<dyn HookGuard>> {
        Some(Box::new((self.0)(fqn)))
    }
}

/// Pin a closure to the hook signature
pub fn hook<F>(f: F) -> F
where
    F: Fn(&HookContext<'_>) -> Option<Fields> + Send + Sync,
{
    f
}

/// Hook whose `enter` closure runs at call start and returns the exit half
///
/// ```rust
/// use std::time::Instant;
/// use time_execution::{entry_hook, fields, on_exit};
///
/// let queued = entry_hook(|_fqn| {
///     let entered = Instant::now();
///     on_exit(move |_ctx| Some(fields! { "in_hook_us" => entered.elapsed().as_micros() as i64 }))
/// });
/// # let _ = queued;
/// ```
pub fn entry_hook<F, G>(enter: F) -> EntryHook<F>
where
    F: Fn(&str) -> G + Send + Sync,
    G: HookGuard + 'static,
{
    EntryHook(enter)
}

/// Pin a closure to the exit half of an [`entry_hook`]
pub fn on_exit<F>(f: F) -> F
where
    F: FnOnce(&HookContext<'_>) -> Option<Fields> + Send,
{
    f
}

/// Short host name, resolved once
pub fn short_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .map(|h| h.trim().split('.').next().unwrap_or_default().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

/// Join a module path and item name into a dotted FQN
pub fn qualified_name(module_path: &str, name: &str) -> String {
    let module = module_path.replace("::", ".");
    if name.is_empty() {
        module
    } else {
        format!("{}.{}", module, name)
    }
}

/// Dotted FQN for an item in the calling module
#[macro_export]
macro_rules! fqn {
    ($name:expr) => {
        $crate::timed::qualified_name(module_path!(), $name)
    };
}

/// Error recorded for a call that unwound instead of returning
pub const CALL_PANICKED: &str = "call panicked";

enum ActiveHook {
    After(SharedHook),
    Entered(Box<dyn HookGuard>),
}

/// Hook selection for a [`Timed`] call, see [`Timed::options`]
pub struct TimedOptions {
    settings: Arc<Settings>,
    fqn: String,
    extra_hooks: Vec<SharedHook>,
    default_hooks: bool,
}

impl TimedOptions {
    /// Add hooks for this call site only, run after the settings' hooks
    pub fn with_extra_hooks(mut self, hooks: impl IntoIterator<Item = SharedHook>) -> Self {
        self.extra_hooks.extend(hooks);
        self
    }

    /// Skip the settings' hooks
    pub fn without_default_hooks(mut self) -> Self {
        self.default_hooks = false;
        self
    }

    /// Start timing now and enter the selected hooks
    pub fn start(self) -> Timed {
        let start = Instant::now();

        let defaults = if self.default_hooks {
            self.settings.hooks.as_slice()
        } else {
            &[]
        };
        let hooks = defaults
            .iter()
            .cloned()
            .chain(self.extra_hooks)
            .filter_map(|hook| {
                match panic::catch_unwind(AssertUnwindSafe(|| hook.enter(&self.fqn))) {
                    Ok(Some(guard)) => Some(ActiveHook::Entered(guard)),
                    Ok(None) => Some(ActiveHook::After(hook)),
                    Err(_) => {
                        warn!(fqn = %self.fqn, "hook panicked on entry, skipping it");
                        None
                    }
                }
            })
            .collect();

        Timed {
            settings: self.settings,
            fqn: self.fqn,
            hooks,
            start,
            error: None,
            finished: false,
        }
    }
}

/// Timer for one call; writes its metric on [`Timed::finish`] or drop
pub struct Timed {
    settings: Arc<Settings>,
    fqn: String,
    hooks: Vec<ActiveHook>,
    start: Instant,
    error: Option<String>,
    finished: bool,
}

impl Timed {
    /// Choose hooks before starting the timer
    pub fn options(settings: Arc<Settings>, fqn: impl Into<String>) -> TimedOptions {
        TimedOptions {
            settings,
            fqn: fqn.into(),
            extra_hooks: Vec::new(),
            default_hooks: true,
        }
    }

    /// Start timing now with the settings' hooks
    pub fn start(settings: Arc<Settings>, fqn: impl Into<String>) -> Self {
        Self::options(settings, fqn).start()
    }

    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    /// Mark the call as failed
    pub fn fail(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    /// Stop timing and write the metric
    pub fn finish(mut self) {
        self.record(None);
    }

    /// Stop timing and write the metric, letting hooks see `response`
    pub fn finish_with<T: Any + Send>(mut self, response: &T) {
        self.record(Some(response as &(dyn Any + Send)));
    }

    fn base_metric(&self) -> Fields {
        let duration_ms = (self.start.elapsed().as_secs_f64() * 1000.0).round();

        let mut metric = Fields::new();
        metric.insert(
            self.settings.duration_field.clone(),
            FieldValue::Float(duration_ms),
        );
        metric.insert(
            "hostname".to_string(),
            FieldValue::from(short_hostname()),
        );
        if let Some(origin) = &self.settings.origin {
            metric.insert("origin".to_string(), FieldValue::from(origin.as_str()));
        }
        metric
    }

    fn record(&mut self, response: Option<&(dyn Any + Send)>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut metric = self.base_metric();
        let mut metadata = Fields::new();
        let hooks = std::mem::take(&mut self.hooks);
        {
            let ctx = HookContext {
                fqn: &self.fqn,
                metric: &metric,
                response,
                error: self.error.as_deref(),
            };

            for hook in hooks {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| match hook {
                    ActiveHook::After(hook) => hook.call(&ctx),
                    ActiveHook::Entered(guard) => guard.exit(&ctx),
                }));
                match outcome {
                    Ok(Some(extra)) => metadata.extend(extra),
                    Ok(None) => {}
                    Err(_) => warn!(fqn = %self.fqn, "hook panicked, metadata skipped"),
                }
            }
        }

        metric.extend(metadata);
        self.settings.write_metric(&self.fqn, metric);
    }
}

impl Drop for Timed {
    fn drop(&mut self) {
        if !self.finished && self.error.is_none() && thread::panicking() {
            self.error = Some(CALL_PANICKED.to_string());
        }
        self.record(None);
    }
}

/// Time `f` and write one metric named `fqn`
pub fn time_execution<T, F>(settings: &SettingsHandle, fqn: &str, f: F) -> T
where
    T: Any + Send,
    F: FnOnce() -> T,
{
    let timed = Timed::start(settings.current(), fqn);
    let response = timed_span(fqn).in_scope(f);
    timed.finish_with(&response);
    response
}

/// Time a fallible call; an `Err` is recorded for the hooks and returned as is
pub fn try_time_execution<T, E, F>(settings: &SettingsHandle, fqn: &str, f: F) -> Result<T, E>
where
    T: Any + Send,
    E: fmt::Display,
    F: FnOnce() -> Result<T, E>,
{
    let mut timed = Timed::start(settings.current(), fqn);
    let result = timed_span(fqn).in_scope(f);
    match &result {
        Ok(response) => timed.finish_with(response),
        Err(e) => {
            timed.fail(e);
            timed.finish();
        }
    }
    result
}

/// Time a future from first poll to completion
pub async fn time_execution_async<T, Fut>(settings: &SettingsHandle, fqn: &str, fut: Fut) -> T
where
    T: Any + Send,
    Fut: Future<Output = T>,
{
    let timed = Timed::start(settings.current(), fqn);
    let response = fut.instrument(timed_span(fqn)).await;
    timed.finish_with(&response);
    response
}

/// Time a fallible future
pub async fn try_time_execution_async<T, E, Fut>(
    settings: &SettingsHandle,
    fqn: &str,
    fut: Fut,
) -> Result<T, E>
where
    T: Any + Send,
    E: fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    let mut timed = Timed::start(settings.current(), fqn);
    let result = fut.instrument(timed_span(fqn)).await;
    match &result {
        Ok(response) => timed.finish_with(response),
        Err(e) => {
            timed.fail(e);
            timed.finish();
        }
    }
    result
}
