//! Subscription options
//!
//! Caller-supplied [`SubscribeOptions`] are resolved against manager-wide
//! [`ConsumerDefaults`] into the [`ConsumerOptions`] a registration runs with.

use std::time::Duration;

/// Default prefetch when nothing else is configured
pub const DEFAULT_PREFETCH: u16 = 10;

/// Default retry attempts when nothing else is configured
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default retry delay when nothing else is configured
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// How the retry delay grows from one hop to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    /// Every hop waits the base delay
    #[default]
    Fixed,
    /// Hop `n` waits `base * 2^n`, capped at `max_delay`
    Exponential { max_delay: Duration },
}

impl RetryBackoff {
    /// Delay before redelivering a message that has already been retried
    /// `retry_count` times
    pub fn delay_for(&self, base: Duration, retry_count: u32) -> Duration {
        match self {
            RetryBackoff::Fixed => base,
            RetryBackoff::Exponential { max_delay } => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*max_delay).min(*max_delay)
            }
        }
    }
}

/// Per-subscription overrides; anything left `None` falls back to defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub prefetch: Option<u16>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Defaults applied to every subscription of a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefaults {
    pub exchange: String,
    pub prefetch: u16,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub backoff: RetryBackoff,
}

impl ConsumerDefaults {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            prefetch: DEFAULT_PREFETCH,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff: RetryBackoff::Fixed,
        }
    }
}

/// Fully resolved options of one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub prefetch: u16,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub dead_letter_exchange: String,
    pub backoff: RetryBackoff,
}

impl ConsumerOptions {
    pub fn resolve(event_type: &str, options: SubscribeOptions, defaults: &ConsumerDefaults) -> Self {
        let exchange = options.exchange.unwrap_or_else(|| defaults.exchange.clone());
        let dead_letter_exchange = options
            .dead_letter_exchange
            .unwrap_or_else(|| format!("{}.dlx", exchange));

        Self {
            queue: options.queue.unwrap_or_else(|| format!("{}.queue", event_type)),
            routing_key: options.routing_key.unwrap_or_else(|| event_type.to_string()),
            prefetch: options.prefetch.filter(|p| *p > 0).unwrap_or(defaults.prefetch),
            retry_attempts: options.retry_attempts.unwrap_or(defaults.retry_attempts),
            retry_delay: options.retry_delay.unwrap_or(defaults.retry_delay),
            backoff: defaults.backoff,
            exchange,
            dead_letter_exchange,
        }
    }

    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }

    /// Delay before the hop that follows `retry_count` earlier retries
    pub fn retry_delay_for(&self, retry_count: u32) -> Duration {
        self.backoff.delay_for(self.retry_delay, retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let defaults = ConsumerDefaults::new("ledger.events");
        let options = ConsumerOptions::resolve("movement.created", SubscribeOptions::new(), &defaults);

        assert_eq!(options.queue, "movement.created.queue");
        assert_eq!(options.retry_queue(), "movement.created.queue.retry");
        assert_eq!(options.dead_letter_queue(), "movement.created.queue.dlq");
        assert_eq!(options.exchange, "ledger.events");
        assert_eq!(options.routing_key, "movement.created");
        assert_eq!(options.dead_letter_exchange, "ledger.events.dlx");
        assert_eq!(options.prefetch, DEFAULT_PREFETCH);
        assert_eq!(options.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(options.retry_delay, DEFAULT_RETRY_DELAY);
    }

    #[test]
    fn test_resolve_overrides() {
        let defaults = ConsumerDefaults::new("ledger.events");
        let options = ConsumerOptions::resolve(
            "movement.*",
            SubscribeOptions::new()
                .queue("ledger-projector")
                .exchange("other.events")
                .routing_key("movement.#")
                .prefetch(1)
                .retry_attempts(0)
                .retry_delay(Duration::from_millis(100))
                .dead_letter_exchange("custom.dlx"),
            &defaults,
        );

        assert_eq!(options.queue, "ledger-projector");
        assert_eq!(options.retry_queue(), "ledger-projector.retry");
        assert_eq!(options.exchange, "other.events");
        assert_eq!(options.routing_key, "movement.#");
        assert_eq!(options.prefetch, 1);
        assert_eq!(options.retry_attempts, 0);
        assert_eq!(options.dead_letter_exchange, "custom.dlx");
    }

    #[test]
    fn test_zero_prefetch_falls_back() {
        let defaults = ConsumerDefaults::new("ledger.events");
        let options = ConsumerOptions::resolve("a.b", SubscribeOptions::new().prefetch(0), &defaults);
        assert_eq!(options.prefetch, DEFAULT_PREFETCH);
    }

    #[test]
    fn test_dead_letter_exchange_follows_custom_exchange() {
        let defaults = ConsumerDefaults::new("ledger.events");
        let options =
            ConsumerOptions::resolve("a.b", SubscribeOptions::new().exchange("audit"), &defaults);
        assert_eq!(options.dead_letter_exchange, "audit.dlx");
    }

    #[test]
    fn test_backoff() {
        let base = Duration::from_millis(100);
        assert_eq!(RetryBackoff::Fixed.delay_for(base, 5), base);

        let exp = RetryBackoff::Exponential {
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(exp.delay_for(base, 0), Duration::from_millis(100));
        assert_eq!(exp.delay_for(base, 1), Duration::from_millis(200));
        assert_eq!(exp.delay_for(base, 3), Duration::from_millis(800));
        assert_eq!(exp.delay_for(base, 4), Duration::from_millis(1000));
        assert_eq!(exp.delay_for(base, 64), Duration::from_millis(1000));
    }
}
