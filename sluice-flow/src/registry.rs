//! Strategy registry.
//!
//! Maps strategy names to controller constructors. The built-in strategies
//! are:
//!
//! | Strategy    | Controller                                     | Required            |
//! |-------------|------------------------------------------------|---------------------|
//! | `global`    | one queue for all requests                     | `capacity`          |
//! | `ows`       | one queue for matching OWS requests            | `capacity`          |
//! | `user`      | one queue per client, cookie keyed by default  | `capacity`          |
//! | `ip`        | one queue per client IP                        | `capacity`          |
//! | `single-ip` | one queue for one client address              | `capacity`, `ip`    |
//! | `rate`      | request counts per key and window              | `limit`, `window_ms`|
//!
//! Further strategies can be registered under new names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::{Clock, Limits, SystemClock};
use tracing::info;

use crate::basic::BasicFlowController;
use crate::config::{ControllerConfig, FlowConfig, KeyStrategy};
use crate::controller::FlowController;
use crate::error::{FlowError, FlowResult};
use crate::key::{CookieKeyGenerator, IpKeyGenerator, KeyGenerator, UserKeyGenerator};
use crate::keyed::KeyedFlowController;
use crate::matcher::SingleIpMatcher;
use crate::pipeline::{timeout_from_millis, FlowPipeline};
use crate::rate::RateFlowController;
use crate::reclaim::ReclaimPolicy;

/// Shared inputs for building controllers.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Clock used by keyed and rate controllers.
    pub clock: Arc<dyn Clock>,
    /// System limits; capacities are checked against them.
    pub limits: Limits,
    /// Reclamation policy for per-key state.
    pub reclaim: ReclaimPolicy,
    /// Partition cookie name.
    pub cookie_name: String,
    /// Max-age of minted partition cookies.
    pub cookie_max_age_secs: u64,
}

impl BuildContext {
    /// Context for `config`, using the system clock.
    #[must_use]
    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            limits: Limits::new(),
            reclaim: config.reclaim,
            cookie_name: config.cookie_name.clone(),
            cookie_max_age_secs: config.cookie_max_age_secs,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Key generator for `strategy`.
    #[must_use]
    pub fn key_generator(&self, strategy: KeyStrategy) -> Box<dyn KeyGenerator> {
        match strategy {
            KeyStrategy::Ip => Box::new(IpKeyGenerator),
            KeyStrategy::Cookie => Box::new(
                CookieKeyGenerator::new(self.cookie_name.clone())
                    .with_max_age(self.cookie_max_age_secs),
            ),
            KeyStrategy::User => Box::new(UserKeyGenerator),
        }
    }

    /// Checks a configured capacity against the limits.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if the capacity is zero or too large.
    pub fn check_capacity(&self, capacity: usize) -> FlowResult<usize> {
        let narrowed = u32::try_from(capacity).unwrap_or(u32::MAX);
        self.limits.check_capacity(narrowed)?;
        Ok(capacity)
    }
}

/// Builds one controller from its configuration entry.
pub type ControllerFactory = Box<
    dyn Fn(&ControllerConfig, &BuildContext) -> FlowResult<Arc<dyn FlowController>> + Send + Sync,
>;

/// Strategy name to constructor map.
pub struct ControllerRegistry {
    factories: HashMap<String, ControllerFactory>,
}

impl ControllerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry holding the built-in strategies.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("global", build_global);
        registry.register("ows", build_ows);
        registry.register("user", |c, ctx| build_keyed(c, ctx, "user", KeyStrategy::Cookie));
        registry.register("ip", |c, ctx| build_keyed(c, ctx, "ip", KeyStrategy::Ip));
        registry.register("single-ip", build_single_ip);
        registry.register("rate", build_rate);
        registry
    }

    /// Registers `factory` under `strategy`, replacing any previous one.
    pub fn register<F>(&mut self, strategy: impl Into<String>, factory: F)
    where
        F: Fn(&ControllerConfig, &BuildContext) -> FlowResult<Arc<dyn FlowController>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(strategy.into(), Box::new(factory));
    }

    /// Registered strategy names, sorted.
    #[must_use]
    pub fn strategies(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the controller described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` for unknown strategies and invalid
    /// parameters.
    pub fn build(
        &self,
        config: &ControllerConfig,
        ctx: &BuildContext,
    ) -> FlowResult<Arc<dyn FlowController>> {
        let factory = self.factories.get(&config.strategy).ok_or_else(|| {
            FlowError::invalid_config(format!(
                "unknown controller strategy '{}', expected one of: {}",
                config.strategy,
                self.strategies().join(", ")
            ))
        })?;
        factory(config, ctx)
    }

    /// Builds every controller of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the limits or the reclaim policy are invalid,
    /// else the first build error.
    pub fn build_all(
        &self,
        config: &FlowConfig,
        ctx: &BuildContext,
    ) -> FlowResult<Vec<Arc<dyn FlowController>>> {
        ctx.limits.validate()?;
        ctx.reclaim.validate()?;
        config.controllers.iter().map(|c| self.build(c, ctx)).collect()
    }

    /// Builds a pipeline for `config` on the system clock.
    ///
    /// # Errors
    ///
    /// Returns the first build error.
    pub fn build_pipeline(&self, config: &FlowConfig) -> FlowResult<FlowPipeline> {
        self.build_pipeline_with(config, &BuildContext::from_config(config))
    }

    /// Builds a pipeline for `config` in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the first build error.
    pub fn build_pipeline_with(
        &self,
        config: &FlowConfig,
        ctx: &BuildContext,
    ) -> FlowResult<FlowPipeline> {
        let controllers = self.build_all(config, ctx)?;
        info!(
            controllers = controllers.len(),
            timeout_ms = config.timeout_ms,
            "flow control configuration loaded"
        );
        Ok(FlowPipeline::new(controllers)
            .with_timeout(timeout_from_millis(config.timeout_ms))
            .with_delay_header(config.delay_header)
            .with_clock(Arc::clone(&ctx.clock)))
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("strategies", &self.strategies())
            .finish()
    }
}

fn shared<C: FlowController + 'static>(controller: C) -> Arc<dyn FlowController> {
    Arc::new(controller)
}

fn build_global(
    config: &ControllerConfig,
    ctx: &BuildContext,
) -> FlowResult<Arc<dyn FlowController>> {
    let capacity = ctx.check_capacity(config.require_capacity()?)?;
    let mut controller = BasicFlowController::global(capacity, config.priority_provider())?;
    if let Some(name) = &config.name {
        controller = controller.with_name(name.clone());
    }
    Ok(shared(controller))
}

fn build_ows(
    config: &ControllerConfig,
    ctx: &BuildContext,
) -> FlowResult<Arc<dyn FlowController>> {
    let capacity = ctx.check_capacity(config.require_capacity()?)?;
    let matcher = config.matcher()?;
    let mut controller = BasicFlowController::for_requests(
        Box::new(matcher),
        capacity,
        config.priority_provider(),
    )?;
    if let Some(name) = &config.name {
        controller = controller.with_name(name.clone());
    }
    Ok(shared(controller))
}

fn build_single_ip(
    config: &ControllerConfig,
    ctx: &BuildContext,
) -> FlowResult<Arc<dyn FlowController>> {
    let capacity = ctx.check_capacity(config.require_capacity()?)?;
    let ip = SingleIpMatcher::parse(config.require_ip()?)?;
    let mut controller = BasicFlowController::single_ip(ip, capacity, config.priority_provider())?;
    if let Some(name) = &config.name {
        controller = controller.with_name(name.clone());
    }
    Ok(shared(controller))
}

fn build_keyed(
    config: &ControllerConfig,
    ctx: &BuildContext,
    kind: &str,
    default_key: KeyStrategy,
) -> FlowResult<Arc<dyn FlowController>> {
    let capacity = ctx.check_capacity(config.require_capacity()?)?;
    let keys = ctx.key_generator(config.key.unwrap_or(default_key));
    let matcher = config.matcher()?;
    let mut controller = KeyedFlowController::new(kind, keys, capacity)?
        .with_clock(Arc::clone(&ctx.clock))
        .with_reclaim(ctx.reclaim);
    if !matcher.is_any() {
        controller = controller.with_matcher(Box::new(matcher));
    }
    if let Some(provider) = config.priority_provider() {
        controller = controller.with_priority(provider);
    }
    if let Some(name) = &config.name {
        controller = controller.with_name(name.clone());
    }
    Ok(shared(controller))
}

fn build_rate(
    config: &ControllerConfig,
    ctx: &BuildContext,
) -> FlowResult<Arc<dyn FlowController>> {
    let (limit, window_ms) = config.require_rate()?;
    let keys = ctx.key_generator(config.key.unwrap_or(KeyStrategy::Ip));
    let mut controller = RateFlowController::new(limit, window_ms)?
        .with_matcher(Box::new(config.matcher()?))
        .with_keys(keys)
        .with_delay(Duration::from_millis(config.delay_ms.unwrap_or(0)))
        .with_clock(Arc::clone(&ctx.clock))
        .with_reclaim(ctx.reclaim);
    if let Some(name) = &config.name {
        controller = controller.with_name(name.clone());
    }
    Ok(shared(controller))
}
