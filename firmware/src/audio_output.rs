// Audio Output
// Alert clip stored on SPIFFS as 16-bit little-endian mono PCM, streamed to an I2S class-D
// amplifier. The amplifier's SD line doubles as mute, its GAIN line selects 9 dB / 3 dB.

use anyhow::{anyhow, Result};
use esp_idf_svc::hal::delay::BLOCK;
use esp_idf_svc::hal::gpio::{AnyIOPin, AnyOutputPin, InputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::hal::i2s::config::{DataBitWidth, StdConfig};
use esp_idf_svc::hal::i2s::{I2s, I2sDriver, I2sTx};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::sys::{self, EspError};
use log::{debug, info};

use coop_supervisor::{AudioDevice, DecodedFrame};

pub const SAMPLE_RATE_HZ: u32 = 44_100;
pub const SPIFFS_BASE_PATH: &str = "/spiffs";
pub const ALERT_CLIP_PATH: &str = "/spiffs/alert.pcm";

const SAMPLES_PER_FRAME: usize = 1152;
const BYTES_PER_SAMPLE: usize = 2;

/// Register the SPIFFS partition holding the alert clip under /spiffs
pub fn mount_storage() -> Result<()> {
    let config = sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    EspError::convert(unsafe { sys::esp_vfs_spiffs_register(&config) })
        .map_err(|e| anyhow!("Mounting SPIFFS at {} failed: {}", SPIFFS_BASE_PATH, e))?;

    info!("📁 SPIFFS mounted at {}", SPIFFS_BASE_PATH);
    Ok(())
}

pub struct AudioOutput {
    i2s: I2sDriver<'static, I2sTx>,
    gain: PinDriver<'static, AnyOutputPin, Output>,
    shutdown: PinDriver<'static, AnyOutputPin, Output>,
    clip_path: &'static str,
}

impl AudioOutput {
    pub fn new(
        i2s: impl Peripheral<P = impl I2s> + 'static,
        bclk: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
        dout: impl Peripheral<P = impl OutputPin> + 'static,
        ws: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
        gain: AnyOutputPin,
        shutdown: AnyOutputPin,
        clip_path: &'static str,
    ) -> Result<Self> {
        let config = StdConfig::philips(SAMPLE_RATE_HZ, DataBitWidth::Bits16);
        let mut i2s = I2sDriver::<I2sTx>::new_std_tx(i2s, &config, bclk, dout, Option::<AnyIOPin>::None, ws)?;
        i2s.tx_enable()?;

        let mut shutdown = PinDriver::output(shutdown)?;
        shutdown.set_low()?;

        info!("🔊 I2S output ready at {} Hz", SAMPLE_RATE_HZ);
        Ok(Self {
            i2s,
            gain: PinDriver::output(gain)?,
            shutdown,
            clip_path,
        })
    }
}

impl AudioDevice for AudioOutput {
    fn load_alert_clip(&mut self) -> Result<Vec<u8>> {
        let clip = std::fs::read(self.clip_path).map_err(|e| anyhow!("Reading {} failed: {}", self.clip_path, e))?;
        info!("🎵 Loaded alert clip {} ({} bytes)", self.clip_path, clip.len());
        Ok(clip)
    }

    fn set_muted(&mut self, muted: bool) -> Result<()> {
        if muted {
            self.shutdown.set_low()?;
        } else {
            self.shutdown.set_high()?;
        }
        Ok(())
    }

    fn set_high_gain(&mut self, high: bool) -> Result<()> {
        if high {
            self.gain.set_high()?;
        } else {
            self.gain.set_low()?;
        }
        Ok(())
    }

    fn decode_frame(&mut self, data: &[u8]) -> Result<Option<DecodedFrame>> {
        let consumed = data.len().min(SAMPLES_PER_FRAME * BYTES_PER_SAMPLE) / BYTES_PER_SAMPLE * BYTES_PER_SAMPLE;
        if consumed == 0 {
            return Ok(None);
        }

        let samples = data[..consumed]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Some(DecodedFrame { consumed, samples }))
    }

    fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        let bytes: Vec<u8> = samples.iter().flat_map(|sample| sample.to_le_bytes()).collect();
        self.i2s.write_all(&bytes, BLOCK)?;
        debug!("🔈 Wrote {} samples", samples.len());
        Ok(())
    }
}
