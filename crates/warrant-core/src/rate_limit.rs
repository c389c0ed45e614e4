//! Token buckets arbitrating shared external resources across tasks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::RateLimitConfig;
use crate::domain::ResourceClass;

/// Milli-tokens per whole token.
const SCALE: u64 = 1_000;

/// A token bucket refilled on access from the caller's clock reading.
///
/// Tokens are kept scaled by 1000 so fractional rates refill smoothly without
/// floats in the hot path.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Milli-tokens added per second.
    rate_milli: u64,
    /// Capacity in milli-tokens.
    capacity: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    /// Refill below one milli-token, carried to the next call.
    carry: u64,
    last_refill: Option<DateTime<Utc>>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = u64::from(burst) * SCALE;
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                carry: 0,
                last_refill: None,
            }),
            rate_milli: (rate_per_sec.max(0.0) * SCALE as f64) as u64,
            capacity,
        }
    }

    /// Refills for the time since the last call, then takes one token if
    /// available. Refill and take happen under one lock.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        if state.tokens < SCALE {
            return false;
        }
        state.tokens -= SCALE;
        true
    }

    /// Puts back a token taken by [`TokenBucket::try_acquire`] whose call
    /// never went out.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tokens = state.tokens.saturating_add(SCALE).min(self.capacity);
    }

    /// Whole tokens currently available.
    pub fn available(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        state.tokens / SCALE
    }

    fn refill(&self, state: &mut BucketState, now: DateTime<Utc>) {
        let Some(last) = state.last_refill else {
            state.last_refill = Some(now);
            return;
        };
        let elapsed_ms = u64::try_from((now - last).num_milliseconds()).unwrap_or(0);
        if elapsed_ms == 0 {
            return;
        }
        let scaled = elapsed_ms
            .saturating_mul(self.rate_milli)
            .saturating_add(state.carry);
        state.tokens = state.tokens.saturating_add(scaled / SCALE);
        state.carry = scaled % SCALE;
        if state.tokens >= self.capacity {
            state.tokens = self.capacity;
            state.carry = 0;
        }
        state.last_refill = Some(now);
    }
}

/// One bucket per configured resource class. Unconfigured classes are not
/// limited.
#[derive(Debug, Default)]
pub struct RateLimiters {
    buckets: HashMap<ResourceClass, TokenBucket>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(limits: &[RateLimitConfig]) -> Self {
        let mut limiters = Self::new();
        for limit in limits {
            limiters.insert(limit.resource_class.clone(), TokenBucket::new(limit.rate_per_sec, limit.burst));
        }
        limiters
    }

    /// Later inserts for the same class replace earlier ones.
    pub fn insert(&mut self, class: ResourceClass, bucket: TokenBucket) {
        self.buckets.insert(class, bucket);
    }

    pub fn try_acquire(&self, class: &ResourceClass, now: DateTime<Utc>) -> bool {
        match self.buckets.get(class) {
            Some(bucket) => bucket.try_acquire(now),
            None => true,
        }
    }

    pub fn release(&self, class: &ResourceClass) {
        if let Some(bucket) = self.buckets.get(class) {
            bucket.release();
        }
    }

    pub fn is_limited(&self, class: &ResourceClass) -> bool {
        self.buckets.contains_key(class)
    }
}
