use std::collections::HashMap;

use crate::{
    dom::{Document, NodeId},
    prefs::{clamp_to_range, NORMAL_SPEED},
};

pub const SPEED_STEP: f64 = 0.1;
pub const TOGGLE_EPSILON: f64 = 0.05;

#[derive(Debug, Default)]
pub struct SpeedController {
    last_rates: HashMap<NodeId, f64>,
}

impl SpeedController {
    pub fn set_speed(
        &mut self,
        doc: &mut Document,
        element: Option<NodeId>,
        speed: f64,
    ) -> Option<f64> {
        let element = element?;
        if !speed.is_finite() || !doc.is_media(element) {
            return None;
        }
        let speed = clamp_to_range(speed);
        doc.set_playback_rate(element, speed);
        self.last_rates.insert(element, speed);
        Some(speed)
    }

    pub fn change_speed(
        &mut self,
        doc: &mut Document,
        element: Option<NodeId>,
        delta: f64,
    ) -> Option<f64> {
        let element = element?;
        let current = doc.playback_rate(element)?;
        self.set_speed(doc, Some(element), current + delta)
    }

    pub fn toggle_preferred_speed(
        &mut self,
        doc: &mut Document,
        element: Option<NodeId>,
        preferred_speed: f64,
    ) -> Option<f64> {
        let element = element?;
        let current = doc.playback_rate(element)?;
        if (current - preferred_speed).abs() < TOGGLE_EPSILON {
            self.set_speed(doc, Some(element), NORMAL_SPEED)
        } else {
            self.set_speed(doc, Some(element), preferred_speed)
        }
    }

    pub fn restore_speed(&mut self, doc: &mut Document, element: Option<NodeId>) -> Option<f64> {
        let element = element?;
        let last_rate = *self.last_rates.get(&element)?;
        let current = doc.playback_rate(element)?;
        if current != last_rate {
            log::debug!("Restoring rate {last_rate} on {element} (was {current})");
            doc.set_playback_rate(element, last_rate);
        }
        Some(last_rate)
    }

    pub fn record(&mut self, element: NodeId, rate: f64) {
        self.last_rates.insert(element, rate);
    }

    pub fn record_if_absent(&mut self, element: NodeId, rate: f64) {
        self.last_rates.entry(element).or_insert(rate);
    }

    pub fn last_rate(&self, element: NodeId) -> Option<f64> {
        self.last_rates.get(&element).copied()
    }

    pub fn forget(&mut self, element: NodeId) {
        self.last_rates.remove(&element);
    }
}
