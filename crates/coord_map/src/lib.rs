use core_types::ConfigError;

/// Affine mapping from sensor pixel coordinates into actuator angles.
///
/// Each input source carries its own mapper, configured with the sensor
/// resolution and the field of view it covers. The origin sits at the frame
/// center; a point right of center maps to a negative pan, a point below
/// center to a negative tilt.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineGazeMapper {
    label: String,
    res_x: f64,
    res_y: f64,
    px_per_deg_x: f64,
    px_per_deg_y: f64,
}

impl AffineGazeMapper {
    pub fn new(
        label: impl Into<String>,
        resolution: (f64, f64),
        fov: (f64, f64),
    ) -> Result<Self, ConfigError> {
        let label = label.into();
        let (res_x, res_y) = resolution;
        let (fov_x, fov_y) = fov;
        if res_x <= 0.0 || res_y <= 0.0 || fov_x <= 0.0 || fov_y <= 0.0 {
            return Err(ConfigError::BadGeometry(label));
        }
        Ok(Self {
            label,
            res_x,
            res_y,
            px_per_deg_x: res_x / fov_x,
            px_per_deg_y: res_y / fov_y,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Maps a pixel coordinate to `(pan_deg, tilt_deg)`. Returns `None` for
    /// points outside the sensor frame; the caller skips the update in that
    /// case rather than commanding an angle the source cannot have seen.
    pub fn map(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !(0.0..=self.res_x).contains(&x) || !(0.0..=self.res_y).contains(&y) {
            return None;
        }
        let pan = (self.res_x / 2.0 - x) / self.px_per_deg_x;
        let tilt = (self.res_y / 2.0 - y) / self.px_per_deg_y;
        Some((pan, tilt))
    }
}
