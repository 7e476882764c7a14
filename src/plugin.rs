//! Spatialization, occlusion and reverb plugin hooks.
//!
//! A plugin is registered once on the [`Mixer`](crate::Mixer). When a source
//! that enables the plugin is initialized, the plugin creates a per-source
//! [`PluginVoice`] on the control thread. The voice moves into the source slot
//! and runs synchronously inside that source's render pipeline, so voices of
//! different sources never share state and may run on different workers.
//!
//! Sources whose plugin is not registered, or who did not enable it, pass
//! audio through untouched.

use core::any::Any;
use std::sync::Arc;

use crate::source::SourceHandle;

/// Opaque per-source plugin settings, downcast by the plugin
pub type PluginSettings = Arc<dyn Any + Send + Sync>;

/// Where a source stands with respect to one plugin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PluginState {
    /// No plugin of this kind is registered
    #[default]
    Absent,
    /// Registered, but the source did not enable it
    Disabled,
    /// The source owns a live voice
    Enabled,
}

/// Position of a source relative to the listener
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatializationParams {
    /// Radians, counter-clockwise from straight ahead
    pub azimuth: f32,
    /// Radians above the horizontal plane
    pub elevation: f32,
    /// Distance to the listener in world units
    pub distance: f32,
    /// Listener-relative position
    pub position: [f32; 3],
    /// Radius inside which the source is rendered omnidirectionally
    pub omni_radius: f32,
}

impl Default for SpatializationParams {
    fn default() -> Self {
        Self {
            azimuth: 0.0,
            elevation: 0.0,
            distance: 0.0,
            position: [0.0; 3],
            omni_radius: 0.0,
        }
    }
}

/// Everything a voice sees about the block it is processing
pub struct PluginInput<'a> {
    pub handle: SourceHandle,
    /// Interleaved input samples
    pub samples: &'a [f32],
    pub channels: usize,
    pub frames: usize,
    pub spatialization: &'a SpatializationParams,
}

/// Per-source processing state created by a plugin
pub trait PluginVoice: Send {
    /// Process one block. `output` is zeroed beforehand and sized for the
    /// plugin's output channel count.
    fn process_audio(&mut self, input: &PluginInput<'_>, output: &mut [f32]);
}

/// Turns (usually mono) sources into positioned stereo
pub trait SpatializationPlugin: Send {
    fn on_init_source(
        &mut self,
        handle: SourceHandle,
        channels: usize,
        settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>>;

    fn on_release_source(&mut self, _handle: SourceHandle) {}

    /// Channels written by the voices
    fn output_channels(&self) -> usize {
        2
    }
}

/// Attenuates and filters sources blocked by geometry
pub trait OcclusionPlugin: Send {
    fn on_init_source(
        &mut self,
        handle: SourceHandle,
        channels: usize,
        settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>>;

    fn on_release_source(&mut self, _handle: SourceHandle) {}
}

/// Adds a reverberant signal to sources
pub trait ReverbPlugin: Send {
    fn on_init_source(
        &mut self,
        handle: SourceHandle,
        channels: usize,
        settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>>;

    fn on_release_source(&mut self, _handle: SourceHandle) {}
}

/// The plugins registered on a mixer
#[derive(Default)]
pub struct Plugins {
    pub spatialization: Option<Box<dyn SpatializationPlugin>>,
    pub occlusion: Option<Box<dyn OcclusionPlugin>>,
    pub reverb: Option<Box<dyn ReverbPlugin>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spatialization<P: SpatializationPlugin + 'static>(mut self, plugin: P) -> Self {
        self.spatialization = Some(Box::new(plugin));
        self
    }

    pub fn with_occlusion<P: OcclusionPlugin + 'static>(mut self, plugin: P) -> Self {
        self.occlusion = Some(Box::new(plugin));
        self
    }

    pub fn with_reverb<P: ReverbPlugin + 'static>(mut self, plugin: P) -> Self {
        self.reverb = Some(Box::new(plugin));
        self
    }
}

/// Voices created for one source, plus the resulting tri-states
#[derive(Default)]
pub(crate) struct SourceVoices {
    pub spatialization: Option<Box<dyn PluginVoice>>,
    pub occlusion: Option<Box<dyn PluginVoice>>,
    pub reverb: Option<Box<dyn PluginVoice>>,
    pub spatialization_state: PluginState,
    pub occlusion_state: PluginState,
    pub reverb_state: PluginState,
}

/// Which plugins a source wants, and with what settings
#[derive(Clone, Default)]
pub struct PluginRequest {
    pub enabled: bool,
    pub settings: Option<PluginSettings>,
}

impl PluginRequest {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            settings: None,
        }
    }

    pub fn with_settings(mut self, settings: PluginSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

fn resolve(
    registered: bool,
    request: &PluginRequest,
    create: impl FnOnce(Option<&PluginSettings>) -> Option<Box<dyn PluginVoice>>,
) -> (Option<Box<dyn PluginVoice>>, PluginState) {
    if !registered {
        return (None, PluginState::Absent);
    }
    if !request.enabled {
        return (None, PluginState::Disabled);
    }
    match create(request.settings.as_ref()) {
        Some(voice) => (Some(voice), PluginState::Enabled),
        None => (None, PluginState::Disabled),
    }
}

impl Plugins {
    /// Create the voices a newly initialized source asked for
    pub(crate) fn init_source(
        &mut self,
        handle: SourceHandle,
        channels: usize,
        spatialization: &PluginRequest,
        occlusion: &PluginRequest,
        reverb: &PluginRequest,
    ) -> SourceVoices {
        let (spat_voice, spat_state) = resolve(self.spatialization.is_some(), spatialization, |s| {
            self.spatialization
                .as_mut()
                .and_then(|p| p.on_init_source(handle, channels, s))
        });
        let (occ_voice, occ_state) = resolve(self.occlusion.is_some(), occlusion, |s| {
            self.occlusion
                .as_mut()
                .and_then(|p| p.on_init_source(handle, channels, s))
        });
        let (rev_voice, rev_state) = resolve(self.reverb.is_some(), reverb, |s| {
            self.reverb
                .as_mut()
                .and_then(|p| p.on_init_source(handle, channels, s))
        });

        SourceVoices {
            spatialization: spat_voice,
            occlusion: occ_voice,
            reverb: rev_voice,
            spatialization_state: spat_state,
            occlusion_state: occ_state,
            reverb_state: rev_state,
        }
    }

    /// Notify every plugin that enabled itself for `handle`
    pub(crate) fn release_source(&mut self, handle: SourceHandle, states: [PluginState; 3]) {
        let [spat, occ, rev] = states;
        if spat == PluginState::Enabled {
            if let Some(p) = self.spatialization.as_mut() {
                p.on_release_source(handle);
            }
        }
        if occ == PluginState::Enabled {
            if let Some(p) = self.occlusion.as_mut() {
                p.on_release_source(handle);
            }
        }
        if rev == PluginState::Enabled {
            if let Some(p) = self.reverb.as_mut() {
                p.on_release_source(handle);
            }
        }
    }

    pub(crate) fn spatialization_channels(&self) -> usize {
        self.spatialization.as_ref().map_or(2, |p| p.output_channels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halve;

    impl PluginVoice for Halve {
        fn process_audio(&mut self, input: &PluginInput<'_>, output: &mut [f32]) {
            for (o, i) in output.iter_mut().zip(input.samples.iter()) {
                *o = i * 0.5;
            }
        }
    }

    struct HalvingOcclusion {
        released: usize,
    }

    impl OcclusionPlugin for HalvingOcclusion {
        fn on_init_source(
            &mut self,
            _handle: SourceHandle,
            _channels: usize,
            _settings: Option<&PluginSettings>,
        ) -> Option<Box<dyn PluginVoice>> {
            Some(Box::new(Halve))
        }

        fn on_release_source(&mut self, _handle: SourceHandle) {
            self.released += 1;
        }
    }

    #[test]
    fn tri_state_per_source() {
        let mut plugins = Plugins::new().with_occlusion(HalvingOcclusion { released: 0 });
        let handle = SourceHandle::new(0, 0);

        let voices = plugins.init_source(
            handle,
            1,
            &PluginRequest::enabled(),
            &PluginRequest::enabled(),
            &PluginRequest::default(),
        );
        assert_eq!(voices.spatialization_state, PluginState::Absent);
        assert_eq!(voices.occlusion_state, PluginState::Enabled);
        assert_eq!(voices.reverb_state, PluginState::Absent);
        assert!(voices.occlusion.is_some());

        let disabled = plugins.init_source(
            handle,
            1,
            &PluginRequest::default(),
            &PluginRequest::default(),
            &PluginRequest::default(),
        );
        assert_eq!(disabled.occlusion_state, PluginState::Disabled);
    }
}
