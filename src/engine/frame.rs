use super::{CameraParams, EngineError, Orthorectify, RectificationEngine, ortho, ortho::OrthoImage};
use crate::{config::OrthoConfig, input, logging::LogConfig};
use nalgebra::{Rotation3, Vector2, Vector3};
use std::path::Path;
use tracing::debug;

/// The built-in engine: pinhole frame cameras rectified onto a GeoTIFF DEM.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameEngine {
    log: LogConfig,
}

impl FrameEngine {
    pub fn new(log: &LogConfig) -> Self {
        Self { log: *log }
    }
}

impl RectificationEngine for FrameEngine {
    type Camera = FrameCamera;

    fn build_camera(&self, params: CameraParams) -> Result<FrameCamera, EngineError> {
        FrameCamera::new(params, self.log)
    }
}

/// A frame camera with known interior and exterior orientation.
///
/// The camera looks down its -Z axis with +X to the right of the image and +Y
/// to the top. Pixel coordinates have their origin at the centre of the top
/// left pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameCamera {
    /// Focal length in pixels along each image axis.
    focal: Vector2<f64>,
    principal: Vector2<f64>,
    dims: (u32, u32),
    position: Vector3<f64>,
    /// Camera to world rotation.
    rotation: Rotation3<f64>,
    log: LogConfig,
}

impl FrameCamera {
    pub fn new(params: CameraParams, log: LogConfig) -> Result<Self, EngineError> {
        let CameraParams {
            focal_len,
            sensor_size,
            pixel_dims,
            transform,
            position,
            orientation,
        } = params;

        if !(focal_len.is_finite() && focal_len > 0.0) {
            return Err(EngineError::InvalidCamera(format!(
                "focal length must be positive but got {focal_len}"
            )));
        }
        if !sensor_size.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(EngineError::InvalidCamera(format!(
                "sensor size must be positive but got {sensor_size:?}"
            )));
        }
        if pixel_dims.0 == 0 || pixel_dims.1 == 0 {
            return Err(EngineError::InvalidCamera(format!(
                "image has no pixels ({}x{})",
                pixel_dims.0, pixel_dims.1
            )));
        }
        if !(position.iter().all(|v| v.is_finite()) && orientation.iter().all(|v| v.is_finite())) {
            return Err(EngineError::InvalidCamera(
                "position and orientation must be finite".into(),
            ));
        }

        let (width, height) = (pixel_dims.0 as f64, pixel_dims.1 as f64);
        let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), orientation.x)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), orientation.y)
            * Rotation3::from_axis_angle(&Vector3::z_axis(), orientation.z);

        debug!(
            ?transform,
            "camera at ({:.3}, {:.3}, {:.3})",
            position.x,
            position.y,
            position.z
        );

        Ok(Self {
            focal: Vector2::new(
                focal_len * width / sensor_size[0],
                focal_len * height / sensor_size[1],
            ),
            principal: Vector2::new(width / 2.0 - 0.5, height / 2.0 - 0.5),
            dims: pixel_dims,
            position,
            rotation,
            log,
        })
    }

    /// Image size in pixels as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.dims
    }

    pub(crate) fn log(&self) -> &LogConfig {
        &self.log
    }

    /// Project the world point `world` into pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera.
    pub fn project(&self, world: &Vector3<f64>) -> Option<Vector2<f64>> {
        // Move the point into the camera frame.
        let cam = self.rotation.inverse() * (world - self.position);
        if cam.z >= 0.0 {
            return None;
        }

        let depth = -cam.z;
        Some(Vector2::new(
            self.principal.x + self.focal.x * cam.x / depth,
            self.principal.y - self.focal.y * cam.y / depth,
        ))
    }

    /// Intersect the ray through `pixel` with the horizontal plane at height
    /// `z`.
    ///
    /// Returns `None` if the ray never reaches the plane.
    pub fn unproject(&self, pixel: &Vector2<f64>, z: f64) -> Option<Vector3<f64>> {
        let ray = self.rotation
            * Vector3::new(
                (pixel.x - self.principal.x) / self.focal.x,
                -(pixel.y - self.principal.y) / self.focal.y,
                -1.0,
            );

        let t = (z - self.position.z) / ray.z;
        (ray.z != 0.0 && t.is_finite() && t > 0.0).then(|| self.position + ray * t)
    }
}

impl Orthorectify for FrameCamera {
    type Artifact = OrthoImage;

    fn orthorectify(
        &self,
        src: &Path,
        dem: &Path,
        options: &OrthoConfig,
        output: Option<&Path>,
    ) -> Result<OrthoImage, EngineError> {
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| input::ortho_path(src, None));
        ortho::rectify(self, src, dem, options, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoTransform;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::f64::consts::FRAC_PI_2;

    fn camera_params(orientation: Vector3<f64>) -> CameraParams {
        CameraParams {
            focal_len: 0.05,
            sensor_size: [0.04, 0.03],
            pixel_dims: (400, 300),
            transform: GeoTransform::identity(),
            position: Vector3::new(1000.0, 2000.0, 600.0),
            orientation,
        }
    }

    fn camera(orientation: Vector3<f64>) -> FrameCamera {
        FrameCamera::new(camera_params(orientation), LogConfig::default()).unwrap()
    }

    #[test]
    fn nadir_point_hits_principal_point() {
        let camera = camera(Vector3::zeros());
        let pixel = camera
            .project(&Vector3::new(1000.0, 2000.0, 100.0))
            .unwrap();

        assert_relative_eq!(pixel, Vector2::new(199.5, 149.5), epsilon = 1e-9);
    }

    #[test]
    fn east_and_north_map_to_right_and_up() {
        let camera = camera(Vector3::zeros());
        // fx = 0.05 * 400 / 0.04 = 500 px, 500 m below the camera.
        let pixel = camera
            .project(&Vector3::new(1010.0, 2020.0, 100.0))
            .unwrap();

        assert_relative_eq!(pixel, Vector2::new(209.5, 129.5), epsilon = 1e-9);
    }

    #[test]
    fn kappa_rotates_about_vertical() {
        // With the camera turned 90 degrees, its +X axis points north.
        let camera = camera(Vector3::new(0.0, 0.0, FRAC_PI_2));
        let pixel = camera
            .project(&Vector3::new(1000.0, 2010.0, 100.0))
            .unwrap();

        assert_relative_eq!(pixel, Vector2::new(209.5, 149.5), epsilon = 1e-9);
    }

    #[test]
    fn points_above_camera_are_not_visible() {
        let camera = camera(Vector3::zeros());
        assert_eq!(camera.project(&Vector3::new(1000.0, 2000.0, 700.0)), None);
    }

    #[rstest]
    #[case(Vector3::zeros())]
    #[case(Vector3::new(0.02, -0.01, 1.2))]
    #[case(Vector3::new(-0.1, 0.05, -2.5))]
    fn unproject_inverts_project(#[case] orientation: Vector3<f64>) {
        let camera = camera(orientation);
        for pixel in [
            Vector2::new(0.0, 0.0),
            Vector2::new(399.0, 0.0),
            Vector2::new(123.25, 287.5),
        ] {
            let ground = camera.unproject(&pixel, 150.0).unwrap();
            assert_relative_eq!(ground.z, 150.0, epsilon = 1e-9);
            assert_relative_eq!(camera.project(&ground).unwrap(), pixel, epsilon = 1e-6);
        }
    }

    #[test]
    fn horizon_ray_does_not_reach_ground() {
        // Pitched past the horizon, the image centre looks at the sky.
        let camera = camera(Vector3::new(0.0, 2.0, 0.0));
        assert_eq!(camera.unproject(&Vector2::new(199.5, 149.5), 0.0), None);
    }

    #[rstest]
    #[case(CameraParams { focal_len: 0.0, ..camera_params(Vector3::zeros()) })]
    #[case(CameraParams { focal_len: f64::NAN, ..camera_params(Vector3::zeros()) })]
    #[case(CameraParams { sensor_size: [0.04, -1.0], ..camera_params(Vector3::zeros()) })]
    #[case(CameraParams { pixel_dims: (0, 300), ..camera_params(Vector3::zeros()) })]
    #[case(CameraParams { orientation: Vector3::new(f64::INFINITY, 0.0, 0.0), ..camera_params(Vector3::zeros()) })]
    fn invalid_parameters_are_rejected(#[case] params: CameraParams) {
        assert!(matches!(
            FrameEngine::default().build_camera(params),
            Err(EngineError::InvalidCamera(_))
        ));
    }
}
