//! Sampling session: the owner of one adapter for its whole lifetime.
//!
//! The lifecycle is strictly ordered:
//!
//! 1. [`Session::retain`] the memory behind any address targets, then
//!    [`Session::register`] every target (fail-fast, ids assigned in order)
//! 2. [`Session::calibrate`] once, which freezes the threshold and seals the
//!    channel set
//! 3. [`Session::run`] once, which returns the [`Trace`]
//!
//! The adapter is released exactly once, either by [`Session::finish`] or
//! when the session is dropped. Every error path goes through `Drop`, so a
//! failed registration or an allocation failure after successful monitors
//! still gives the adapter back.

use std::sync::Arc;

use crate::calibrate::{Calibrator, Threshold, ThresholdSource};
use crate::channel::{Channel, ChannelId, ChannelRegistry, Target};
use crate::classify::Classifier;
use crate::error::{EngineError, Result};
use crate::probe::ProbeAdapter;
use crate::sampler::{CancelToken, Sampler, SamplerConfig};
use crate::target::MemoryRegion;
use crate::trace::Trace;

pub struct Session {
    adapter: Option<Box<dyn ProbeAdapter>>,
    adapter_name: &'static str,
    registry: ChannelRegistry,
    calibrator: Calibrator,
    sampled: bool,
}

impl Session {
    pub fn new(adapter: Box<dyn ProbeAdapter>) -> Self {
        let adapter_name = adapter.name();
        log::debug!("session opened on {adapter_name} adapter");
        Self {
            adapter: Some(adapter),
            adapter_name,
            registry: ChannelRegistry::new(),
            calibrator: Calibrator::new(),
            sampled: false,
        }
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter_name
    }

    pub fn channels(&self) -> &[Channel] {
        self.registry.channels()
    }

    pub fn threshold(&self) -> Option<Threshold> {
        self.calibrator.threshold()
    }

    /// Hand `region` to the adapter, which keeps it alive until release.
    /// Address targets must lie inside a retained region.
    pub fn retain<R: MemoryRegion + 'static>(&mut self, region: Arc<R>) -> Result<()> {
        if self.registry.is_sealed() {
            return Err(EngineError::SessionState(
                "memory must be retained before calibration",
            ));
        }
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or(EngineError::SessionState("adapter already released"))?;
        adapter.retain(region);
        Ok(())
    }

    pub fn register(&mut self, target: Target) -> Result<ChannelId> {
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or(EngineError::SessionState("adapter already released"))?;
        self.registry.register(adapter, target)
    }

    pub fn register_all<I>(&mut self, targets: I) -> Result<Vec<ChannelId>>
    where
        I: IntoIterator<Item = Target>,
    {
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or(EngineError::SessionState("adapter already released"))?;
        self.registry.register_all(adapter, targets)
    }

    /// Freeze the threshold. No channel can be added afterwards.
    pub fn calibrate(&mut self, source: ThresholdSource) -> Result<Threshold> {
        if self.registry.is_empty() {
            return Err(EngineError::SessionState(
                "register at least one channel before calibrating",
            ));
        }
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or(EngineError::SessionState("adapter already released"))?;
        self.registry.seal();
        self.calibrator.calibrate(adapter, source)
    }

    /// Sample once and return the labelled trace.
    pub fn run(&mut self, config: &SamplerConfig, cancel: &CancelToken) -> Result<Trace> {
        if self.sampled {
            return Err(EngineError::SessionState("session has already sampled"));
        }
        let threshold = self
            .calibrator
            .threshold()
            .ok_or(EngineError::SessionState("sampling requires a calibrated threshold"))?;
        if self.registry.is_empty() {
            return Err(EngineError::SessionState("no channels registered"));
        }
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or(EngineError::SessionState("adapter already released"))?;

        let sampler = Sampler::new(*config)?;
        self.sampled = true;
        let classifier = Classifier::new(threshold, self.registry.channels());
        log::info!(
            "sampling {} channels ({}, max {} samples, slot {} cycles)",
            self.registry.len(),
            config.mode,
            config.max_samples,
            config.slot_time
        );
        let rows = sampler.run(adapter, &classifier, cancel)?;
        log::info!("collected {} samples", rows.len());

        Ok(Trace::new(
            self.registry.channels().to_vec(),
            threshold,
            config.mode,
            rows,
        ))
    }

    /// Release the adapter now instead of at drop.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.release();
            log::debug!("released {} adapter", self.adapter_name);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("adapter", &self.adapter_name)
            .field("released", &self.adapter.is_none())
            .field("channels", &self.registry.len())
            .field("threshold", &self.calibrator.threshold())
            .field("sampled", &self.sampled)
            .finish()
    }
}
