// Audio Alert Channel
// Coalescing trigger plus a dedicated playback task driving the external decoder / output stage

use core::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};

use crate::config::SupervisorConfig;

/// One decoded chunk of the alert clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Bytes of the input consumed to produce this frame
    pub consumed: usize,
    pub samples: Vec<i16>,
}

/// Output stage and clip decoder
pub trait AudioDevice {
    fn load_alert_clip(&mut self) -> Result<Vec<u8>>;
    fn set_muted(&mut self, muted: bool) -> Result<()>;
    fn set_high_gain(&mut self, high: bool) -> Result<()>;
    /// Decode the next frame from the start of `data`; `None` at end of stream
    fn decode_frame(&mut self, data: &[u8]) -> Result<Option<DecodedFrame>>;
    fn write_samples(&mut self, samples: &[i16]) -> Result<()>;
}

/// Non-blocking alert trigger.
///
/// Backed by a `Signal`, so any number of triggers while the clip is playing collapse
/// into a single pending one.
pub struct AudioAlert {
    pending: Signal<CriticalSectionRawMutex, ()>,
    triggers: AtomicU32,
}

impl AudioAlert {
    pub const fn new() -> Self {
        Self {
            pending: Signal::new(),
            triggers: AtomicU32::new(0),
        }
    }

    pub fn trigger_alert(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
        self.pending.signal(());
        debug!("🔔 Audio alert triggered");
    }

    /// Total triggers since boot, coalesced or not
    pub fn trigger_count(&self) -> u32 {
        self.triggers.load(Ordering::Relaxed)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.signaled()
    }

    pub async fn wait(&self) {
        self.pending.wait().await
    }
}

impl Default for AudioAlert {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AudioChannel<D: AudioDevice> {
    device: D,
    volume: f32,
    high_gain: bool,
    plays_per_alert: u32,
    clip: Option<Vec<u8>>,
}

impl<D: AudioDevice> AudioChannel<D> {
    pub fn new(device: D, config: &SupervisorConfig) -> Self {
        Self {
            device,
            volume: config.audio_volume.clamp(0.0, 1.0),
            high_gain: config.audio_high_gain,
            plays_per_alert: config.audio_plays_per_alert,
            clip: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub async fn run(&mut self, alert: &AudioAlert) -> ! {
        info!("🔊 Audio alert channel started");

        // the output stage stays muted between alerts
        if let Err(e) = self.device.set_muted(true) {
            warn!("⚠️ Failed to mute audio output: {}", e);
        }

        loop {
            alert.wait().await;
            if let Err(e) = self.play_alert().await {
                warn!("⚠️ Audio alert failed: {}", e);
            }
        }
    }

    /// Unmute, set alert levels, play the clip the configured number of times, re-mute
    pub async fn play_alert(&mut self) -> Result<()> {
        if self.clip.is_none() {
            let clip = self.device.load_alert_clip()?;
            if clip.is_empty() {
                return Err(anyhow!("Alert clip is empty"));
            }
            info!("🎵 Loaded alert clip ({} bytes)", clip.len());
            self.clip = Some(clip);
        }

        self.device.set_high_gain(self.high_gain)?;
        self.device.set_muted(false)?;
        info!("🔊 Playing alert x{} (volume {:.2})", self.plays_per_alert, self.volume);

        let mut result = Ok(());
        for _ in 0..self.plays_per_alert {
            result = self.play_clip().await;
            if result.is_err() {
                break;
            }
        }

        if let Err(e) = self.device.set_muted(true) {
            warn!("⚠️ Failed to re-mute audio output: {}", e);
        }
        result
    }

    async fn play_clip(&mut self) -> Result<()> {
        let Some(clip) = self.clip.as_deref() else {
            return Err(anyhow!("Alert clip not loaded"));
        };

        let mut offset = 0;
        while offset < clip.len() {
            let Some(mut frame) = self.device.decode_frame(&clip[offset..])? else {
                break;
            };
            if frame.consumed == 0 {
                return Err(anyhow!("Decoder made no progress at offset {}", offset));
            }

            if self.volume < 1.0 {
                for sample in frame.samples.iter_mut() {
                    *sample = (*sample as f32 * self.volume) as i16;
                }
            }
            self.device.write_samples(&frame.samples)?;
            offset += frame.consumed;

            yield_now().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAudio;
    use embassy_futures::select::select;
    use embassy_time::{Duration, Timer};

    fn channel(device: MockAudio) -> AudioChannel<MockAudio> {
        AudioChannel::new(device, &SupervisorConfig::default())
    }

    #[test]
    fn triggers_coalesce_into_one_pending_alert() {
        let alert = AudioAlert::new();
        alert.trigger_alert();
        alert.trigger_alert();
        alert.trigger_alert();
        assert_eq!(alert.trigger_count(), 3);

        embassy_futures::block_on(alert.wait());
        assert!(!alert.is_pending());
    }

    #[test]
    fn triggers_during_playback_queue_exactly_one_more_alert() {
        static ALERT: AudioAlert = AudioAlert::new();
        fn retrigger() {
            ALERT.trigger_alert();
            ALERT.trigger_alert();
            ALERT.trigger_alert();
        }

        let mut device = MockAudio::with_clip(vec![0x10; 8], 4);
        device.on_first_write = Some(retrigger);
        let mut channel = channel(device);

        ALERT.trigger_alert();
        embassy_futures::block_on(async {
            let _ = select(channel.run(&ALERT), Timer::after(Duration::from_millis(200))).await;
        });

        let device = channel.device();
        assert_eq!(ALERT.trigger_count(), 4);
        // initial mute, then one unmute / re-mute pair per played alert
        assert_eq!(device.mute_settings, vec![true, false, true, false, true]);
        assert_eq!(device.writes.len(), 2 * 3 * 2);
        assert_eq!(device.clip_loads, 1);
        assert!(!ALERT.is_pending());
    }

    #[test]
    fn alert_unmutes_plays_clip_three_times_and_remutes() {
        let mut channel = channel(MockAudio::with_clip(vec![0x10; 8], 4));
        embassy_futures::block_on(channel.play_alert()).unwrap();

        let device = channel.device();
        assert_eq!(device.writes.len(), 3 * 2);
        assert_eq!(device.gain_settings, vec![true]);
        assert_eq!(device.mute_settings, vec![false, true]);
        assert_eq!(device.clip_loads, 1);
    }

    #[test]
    fn volume_scales_samples() {
        let mut config = SupervisorConfig::default();
        config.audio_volume = 0.5;
        config.audio_plays_per_alert = 1;
        let mut channel = AudioChannel::new(MockAudio::with_clip(vec![0x10; 4], 4), &config);

        embassy_futures::block_on(channel.play_alert()).unwrap();
        assert_eq!(channel.device().writes, vec![vec![500, 500]]);
    }

    #[test]
    fn output_is_remuted_after_a_write_failure() {
        let mut device = MockAudio::with_clip(vec![0x10; 8], 4);
        device.fail_writes = true;
        let mut channel = channel(device);

        assert!(embassy_futures::block_on(channel.play_alert()).is_err());
        assert_eq!(channel.device().mute_settings.last(), Some(&true));
    }

    #[test]
    fn empty_clip_is_an_error() {
        let mut channel = channel(MockAudio::with_clip(Vec::new(), 4));
        assert!(embassy_futures::block_on(channel.play_alert()).is_err());
        assert!(channel.device().mute_settings.is_empty());
    }
}
