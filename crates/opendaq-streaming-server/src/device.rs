// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated acquisition device.
//!
//! ```text
//! /sim/dev/time    Int64  linear   (domain, 1 tick per sample)
//! /sim/dev/sine    Float64 explicit  -> time
//! /sim/dev/saw     Float32 explicit  -> time
//! /sim/dev/status  Int64  constant
//! ```

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use opendaq_streaming::signal::{
    DataDescriptor, DataPacket, DataRule, LocalDevice, Ratio, SampleType, Signal, Unit,
};
use tracing::debug;

/// Seconds between status changes.
const STATUS_PERIOD_SECS: u64 = 5;

pub struct SimulatedDevice {
    device: LocalDevice,
    time: Arc<Signal>,
    sine: Arc<Signal>,
    saw: Arc<Signal>,
    status: Arc<Signal>,
}

impl SimulatedDevice {
    pub fn new(sample_rate: u32) -> Self {
        let time = Arc::new(
            Signal::new(
                "/sim/dev/time",
                Some(
                    DataDescriptor::new(SampleType::Int64)
                        .with_name("Time")
                        .with_rule(DataRule::Linear { delta: 1, start: 0 })
                        .with_unit(Unit::seconds())
                        .with_tick_resolution(Ratio::new(1, i64::from(sample_rate)))
                        .with_origin("1970-01-01T00:00:00Z"),
                ),
            )
            .with_description("Sample clock"),
        );
        let sine = Arc::new(
            Signal::new(
                "/sim/dev/sine",
                Some(
                    DataDescriptor::new(SampleType::Float64)
                        .with_name("Sine")
                        .with_unit(Unit::new("V"))
                        .with_range(-10.0, 10.0),
                ),
            )
            .with_description("10 V sine at 1 Hz")
            .with_domain(time.clone()),
        );
        let saw = Arc::new(
            Signal::new(
                "/sim/dev/saw",
                Some(
                    DataDescriptor::new(SampleType::Float32)
                        .with_name("Sawtooth")
                        .with_range(0.0, 1.0),
                ),
            )
            .with_domain(time.clone()),
        );
        let status = Arc::new(
            Signal::new(
                "/sim/dev/status",
                Some(
                    DataDescriptor::new(SampleType::Int64)
                        .with_name("Status")
                        .with_rule(DataRule::Constant),
                ),
            )
            .with_description("Acquisition state"),
        );

        let device = LocalDevice::new("sim");
        device.add_signal(sine.clone());
        device.add_signal(saw.clone());
        device.add_signal(status.clone());

        Self {
            device,
            time,
            sine,
            saw,
            status,
        }
    }

    pub fn device(&self) -> &LocalDevice {
        &self.device
    }

    /// Produce one block of samples every `block` until `running` clears.
    pub fn spawn_generator(
        &self,
        sample_rate: u32,
        block: Duration,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let generator = Generator {
            time: self.time.clone(),
            sine: self.sine.clone(),
            saw: self.saw.clone(),
            status: self.status.clone(),
            sample_rate,
            block,
        };
        thread::Builder::new()
            .name("sim-generator".to_string())
            .spawn(move || generator.run(&running))
    }
}

struct Generator {
    time: Arc<Signal>,
    sine: Arc<Signal>,
    saw: Arc<Signal>,
    status: Arc<Signal>,
    sample_rate: u32,
    block: Duration,
}

impl Generator {
    fn run(&self, running: &AtomicBool) {
        let per_block =
            ((u128::from(self.sample_rate) * self.block.as_millis()) / 1000).max(1) as usize;
        let rate = f64::from(self.sample_rate);
        let started = Instant::now();
        let mut next = started;
        let mut index: i64 = 0;

        while running.load(Ordering::Relaxed) {
            let (Some(time_desc), Some(sine_desc), Some(saw_desc), Some(status_desc)) = (
                self.time.descriptor(),
                self.sine.descriptor(),
                self.saw.descriptor(),
                self.status.descriptor(),
            ) else {
                return;
            };

            let domain = Arc::new(DataPacket::linear(time_desc, per_block, index));
            let sine: Vec<f64> = (0..per_block)
                .map(|i| 10.0 * (TAU * (index + i as i64) as f64 / rate).sin())
                .collect();
            let saw: Vec<f32> = (0..per_block)
                .map(|i| ((index + i as i64) as f64 / rate).fract() as f32)
                .collect();

            self.sine.send_packet(
                DataPacket::from_samples(sine_desc, &sine).with_domain(domain.clone()),
            );
            self.saw
                .send_packet(DataPacket::from_samples(saw_desc, &saw).with_domain(domain));

            let state = (started.elapsed().as_secs() / STATUS_PERIOD_SECS % 3) as i64;
            self.status
                .send_packet(DataPacket::from_samples(status_desc, &[state]));

            index += per_block as i64;
            next += self.block;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                debug!("generator running {:?} behind", now - next);
                next = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendaq_streaming::signal::Device;

    #[test]
    fn test_device_layout() {
        let sim = SimulatedDevice::new(1000);
        let ids: Vec<String> = sim
            .device()
            .signals_recursive()
            .iter()
            .map(|s| s.global_id().to_string())
            .collect();
        assert_eq!(ids, vec!["/sim/dev/sine", "/sim/dev/saw", "/sim/dev/status"]);
        assert_eq!(
            sim.sine.domain_signal().unwrap().global_id(),
            "/sim/dev/time"
        );
    }
}
