//! Exponentially decayed background model.
//!
//! The model keeps a floating-point reference image and classifies each new
//! frame by the fraction of pixels that differ from it by more than a per-pixel
//! threshold. After every comparison the reference moves toward the current
//! frame, so anything that stops moving eventually becomes background: the
//! model reports transients, not lingering presence.

use anyhow::{anyhow, Result};

use crate::frame::Frame;

/// Tuning parameters for [`BackgroundModel`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackgroundParams {
    /// Weight of the existing reference per update, in (0, 1).
    pub alpha: f32,
    /// Absolute per-pixel intensity difference that counts as "changed".
    pub diff_threshold: f32,
    /// Fraction of changed pixels, in [0, 1], required to call a frame motion.
    pub area_threshold: f32,
}

impl BackgroundParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(anyhow!("background alpha must be in (0, 1), got {}", self.alpha));
        }
        if !(self.diff_threshold >= 0.0) {
            return Err(anyhow!(
                "background diff_threshold must be >= 0, got {}",
                self.diff_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.area_threshold) {
            return Err(anyhow!(
                "background area_threshold must be in [0, 1], got {}",
                self.area_threshold
            ));
        }
        Ok(())
    }
}

pub struct BackgroundModel {
    params: BackgroundParams,
    accumulator: Vec<f32>,
    width: u32,
    height: u32,
    initialized: bool,
    last_changed_fraction: f32,
}

impl BackgroundModel {
    pub fn new(params: BackgroundParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            accumulator: Vec::new(),
            width: 0,
            height: 0,
            initialized: false,
            last_changed_fraction: 0.0,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Dimensions learned from the first frame, if any.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.initialized.then_some((self.width, self.height))
    }

    /// Changed-pixel fraction computed by the most recent comparison.
    pub fn last_changed_fraction(&self) -> f32 {
        self.last_changed_fraction
    }

    /// Feed one frame. Returns whether the frame shows motion.
    ///
    /// The first frame seeds the reference and never reports motion. A frame
    /// whose dimensions differ from the seeded reference is rejected and
    /// leaves the model untouched.
    pub fn update(&mut self, frame: &Frame) -> Result<bool> {
        if !self.initialized {
            self.accumulator = frame.pixels().iter().map(|&px| px as f32).collect();
            self.width = frame.width;
            self.height = frame.height;
            self.initialized = true;
            self.last_changed_fraction = 0.0;
            return Ok(false);
        }

        if !frame.same_dimensions(self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{} but background model is {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }

        let alpha = self.params.alpha;
        let threshold = self.params.diff_threshold;
        let mut changed = 0usize;
        for (acc, &px) in self.accumulator.iter_mut().zip(frame.pixels()) {
            let px = px as f32;
            if (*acc - px).abs() > threshold {
                changed += 1;
            }
            *acc = *acc * alpha + px * (1.0 - alpha);
        }

        let fraction = changed as f32 / self.accumulator.len() as f32;
        self.last_changed_fraction = fraction;
        let motion = fraction >= self.params.area_threshold;
        log::trace!("background: changed_fraction={:.4} motion={}", fraction, motion);
        Ok(motion)
    }

    /// Forget the learned reference; the next frame seeds a new one.
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.width = 0;
        self.height = 0;
        self.initialized = false;
        self.last_changed_fraction = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(alpha: f32) -> BackgroundParams {
        BackgroundParams {
            alpha,
            diff_threshold: 10.0,
            area_threshold: 0.5,
        }
    }

    #[test]
    fn first_frame_seeds_without_motion() -> Result<()> {
        let mut model = BackgroundModel::new(params(0.9))?;
        assert!(!model.is_initialized());
        let motion = model.update(&Frame::filled(4, 4, 200)?)?;
        assert!(!motion);
        assert!(model.is_initialized());
        assert_eq!(model.dimensions(), Some((4, 4)));
        Ok(())
    }

    #[test]
    fn large_change_reports_motion() -> Result<()> {
        let mut model = BackgroundModel::new(params(0.9))?;
        model.update(&Frame::filled(10, 10, 0)?)?;

        // 70 of 100 pixels jump well past the threshold.
        let mut pixels = vec![0u8; 100];
        pixels[..70].fill(255);
        let motion = model.update(&Frame::new(10, 10, pixels)?)?;
        assert!(motion);
        assert!((model.last_changed_fraction() - 0.7).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn small_change_below_area_threshold_is_quiet() -> Result<()> {
        let mut model = BackgroundModel::new(params(0.9))?;
        model.update(&Frame::filled(10, 10, 0)?)?;
        let mut pixels = vec![0u8; 100];
        pixels[..20].fill(255);
        assert!(!model.update(&Frame::new(10, 10, pixels)?)?);
        Ok(())
    }

    #[test]
    fn identical_frames_converge_for_any_alpha() -> Result<()> {
        for alpha in [0.1_f32, 0.5, 0.9, 0.99] {
            let mut model = BackgroundModel::new(params(alpha))?;
            model.update(&Frame::filled(8, 8, 0)?)?;
            let target = Frame::filled(8, 8, 255)?;
            let mut quiet = false;
            for _ in 0..2_000 {
                model.update(&target)?;
                if model.last_changed_fraction() == 0.0 {
                    quiet = true;
                    break;
                }
            }
            assert!(quiet, "alpha {} never converged", alpha);
        }
        Ok(())
    }

    #[test]
    fn mismatched_dimensions_are_rejected_without_side_effects() -> Result<()> {
        let mut model = BackgroundModel::new(params(0.5))?;
        model.update(&Frame::filled(4, 4, 50)?)?;
        assert!(model.update(&Frame::filled(2, 2, 50)?).is_err());
        assert_eq!(model.dimensions(), Some((4, 4)));
        assert!(!model.update(&Frame::filled(4, 4, 50)?)?);
        Ok(())
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(BackgroundModel::new(params(0.0)).is_err());
        assert!(BackgroundModel::new(params(1.0)).is_err());
        let mut p = params(0.5);
        p.area_threshold = 1.5;
        assert!(BackgroundModel::new(p).is_err());
    }

    #[test]
    fn reset_relearns_from_next_frame() -> Result<()> {
        let mut model = BackgroundModel::new(params(0.5))?;
        model.update(&Frame::filled(4, 4, 0)?)?;
        model.reset();
        assert!(!model.is_initialized());
        assert!(!model.update(&Frame::filled(2, 2, 255)?)?);
        assert_eq!(model.dimensions(), Some((2, 2)));
        Ok(())
    }
}
