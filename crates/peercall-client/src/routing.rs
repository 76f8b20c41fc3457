//! Classification of incoming video tracks as camera or screen share.
//!
//! Both arrive as video-kind tracks on the same transport. The remote side
//! announces each feature before adding its track, so the receiver can decide
//! from the announced flags and the arrival order: with both features on and
//! nothing classified yet, the first track is the camera and the next one the
//! screen share.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoRoute {
    Camera,
    ScreenShare,
}

#[derive(Debug, Default, Clone)]
pub struct TrackRouter {
    remote_camera: bool,
    remote_screen: bool,
    camera_tracks: u32,
    screen_tracks: u32,
}

impl TrackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote_camera(&mut self, on: bool) {
        self.remote_camera = on;
        if !on {
            self.camera_tracks = 0;
        }
    }

    pub fn set_remote_screen(&mut self, on: bool) {
        self.remote_screen = on;
        if !on {
            self.screen_tracks = 0;
        }
    }

    pub fn remote_camera(&self) -> bool {
        self.remote_camera
    }

    pub fn remote_screen(&self) -> bool {
        self.remote_screen
    }

    /// Classify the next arriving video track.
    pub fn classify(&mut self) -> VideoRoute {
        let route = match (self.remote_camera, self.remote_screen) {
            (_, false) => VideoRoute::Camera,
            (false, true) => VideoRoute::ScreenShare,
            (true, true) => {
                if self.camera_tracks == 0 {
                    VideoRoute::Camera
                } else if self.screen_tracks == 0 {
                    VideoRoute::ScreenShare
                } else {
                    // Both already routed; a replacement track keeps the camera slot.
                    VideoRoute::Camera
                }
            }
        };
        match route {
            VideoRoute::Camera => self.camera_tracks += 1,
            VideoRoute::ScreenShare => self.screen_tracks += 1,
        }
        debug!(
            ?route,
            camera = self.remote_camera,
            screen = self.remote_screen,
            "classified remote video track"
        );
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_feature_routes_directly() {
        let mut router = TrackRouter::new();
        router.set_remote_screen(true);
        assert_eq!(router.classify(), VideoRoute::ScreenShare);

        let mut router = TrackRouter::new();
        router.set_remote_camera(true);
        assert_eq!(router.classify(), VideoRoute::Camera);
    }

    #[test]
    fn simultaneous_toggles_route_camera_then_screen() {
        let mut router = TrackRouter::new();
        router.set_remote_camera(true);
        router.set_remote_screen(true);
        assert_eq!(router.classify(), VideoRoute::Camera);
        assert_eq!(router.classify(), VideoRoute::ScreenShare);
    }

    #[test]
    fn camera_first_then_screen_added() {
        let mut router = TrackRouter::new();
        router.set_remote_camera(true);
        assert_eq!(router.classify(), VideoRoute::Camera);
        router.set_remote_screen(true);
        assert_eq!(router.classify(), VideoRoute::ScreenShare);
    }

    #[test]
    fn toggling_off_restarts_classification() {
        let mut router = TrackRouter::new();
        router.set_remote_camera(true);
        router.set_remote_screen(true);
        assert_eq!(router.classify(), VideoRoute::Camera);
        assert_eq!(router.classify(), VideoRoute::ScreenShare);

        router.set_remote_camera(false);
        router.set_remote_camera(true);
        // Screen is still counted, so the re-enabled camera gets its slot back.
        assert_eq!(router.classify(), VideoRoute::Camera);
    }

    #[test]
    fn same_sequence_same_result() {
        let run = || {
            let mut router = TrackRouter::new();
            let mut routes = Vec::new();
            router.set_remote_screen(true);
            routes.push(router.classify());
            router.set_remote_camera(true);
            routes.push(router.classify());
            router.set_remote_screen(false);
            routes.push(router.classify());
            routes
        };
        assert_eq!(run(), run());
        assert_eq!(
            run(),
            vec![VideoRoute::ScreenShare, VideoRoute::Camera, VideoRoute::Camera]
        );
    }
}
