use egui::Pos2;
use greentouch::config::SensorSettings;

/// Fits the sensor's output coordinate space into the window.
pub struct Dimensions {
    pub sensor_width: f32,
    pub sensor_height: f32,
    pub screen_width: f32,
    pub screen_height: f32,
    pub margin: f32,
}

impl Dimensions {
    pub fn new(sensor: SensorSettings) -> Self {
        Self {
            sensor_width: sensor.resolution_x as f32,
            sensor_height: sensor.resolution_y as f32,
            screen_width: 672.0,
            screen_height: 432.0,
            margin: 15.0,
        }
    }

    pub fn scale(&self) -> f32 {
        let ratio_screen = self.screen_width / self.screen_height;
        let ratio_sensor = self.sensor_width / self.sensor_height;

        if ratio_screen > ratio_sensor {
            self.screen_height / (self.sensor_height + self.margin * 2.0)
        } else {
            self.screen_width / (self.sensor_width + self.margin * 2.0)
        }
    }

    /// Top-left corner of the sensor area, centred in the window.
    pub fn corner(&self, scale: f32) -> Pos2 {
        Pos2::new(
            self.screen_width / 2.0 - (self.sensor_width / 2.0) * scale,
            self.screen_height / 2.0 - (self.sensor_height / 2.0) * scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_window_is_height_bound() {
        let mut dims = Dimensions::new(SensorSettings::default());
        dims.screen_width = 2000.0;
        dims.screen_height = 500.0;
        let scale = dims.scale();
        assert!((scale - 500.0 / 1110.0).abs() < 1e-6);

        let corner = dims.corner(scale);
        assert!(corner.x > 0.0);
        assert!((corner.y - (250.0 - 540.0 * scale)).abs() < 1e-3);
    }

    #[test]
    fn test_tall_window_is_width_bound() {
        let mut dims = Dimensions::new(SensorSettings::default());
        dims.screen_width = 500.0;
        dims.screen_height = 2000.0;
        assert!((dims.scale() - 500.0 / 1950.0).abs() < 1e-6);
    }
}
