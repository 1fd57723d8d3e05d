//! Alarm hooks evaluated on samples written to an active job.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;
use des_core::codes::event_codes;
use des_core::models::{AdminSettings, ConfigSettings, SampleRecord, ValveMode};
use parking_lot::Mutex;

/// An alarm condition that just became true.
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedAlarm {
    pub code: i32,
    pub msg: String,
}

pub trait AlarmEvaluator: Send + Sync {
    /// Evaluate one sample. Returns only newly raised alarms.
    fn evaluate(
        &self,
        serial: &str,
        admin: &AdminSettings,
        config: &ConfigSettings,
        sample: &SampleRecord,
    ) -> Vec<RaisedAlarm>;

    /// Forget a device's alarm state, e.g. at job end.
    fn reset(&self, serial: &str);
}

/// Evaluator that never raises anything.
#[derive(Debug, Default)]
pub struct NoAlarms;

impl AlarmEvaluator for NoAlarms {
    fn evaluate(
        &self,
        _serial: &str,
        _admin: &AdminSettings,
        _config: &ConfigSettings,
        _sample: &SampleRecord,
    ) -> Vec<RaisedAlarm> {
        Vec::new()
    }

    fn reset(&self, _serial: &str) {}
}

/// Sliding window of `(time, value)` covering at least `span` millis once full.
#[derive(Debug, Default)]
struct Window {
    points: VecDeque<(i64, f32)>,
}

impl Window {
    fn push(&mut self, time: i64, value: f32, span: i64) {
        if self.points.back().is_some_and(|(t, _)| time < *t) {
            // Out of order; restart the window.
            self.points.clear();
        }
        self.points.push_back((time, value));
        // Keep one point at or before the window start.
        while self.points.len() >= 2 && self.points[1].0 <= time.saturating_sub(span) {
            self.points.pop_front();
        }
    }

    /// Spread of the window if it covers `span`, else `None`.
    fn spread(&self, span: i64) -> Option<f32> {
        let (first, _) = self.points.front()?;
        let (last, _) = self.points.back()?;
        if last.saturating_sub(*first) < span {
            return None;
        }
        let (min, max) = self
            .points
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), (_, v)| (lo.min(*v), hi.max(*v)));
        Some(max - min)
    }

    fn clear(&mut self) {
        self.points.clear();
    }
}

#[derive(Debug, Default)]
struct DeviceAlarms {
    active: HashSet<i32>,
    press: Window,
    flow: Window,
}

impl DeviceAlarms {
    // Edge trigger: report only on the false -> true transition.
    fn edge(&mut self, code: i32, condition: bool) -> bool {
        if condition {
            self.active.insert(code)
        } else {
            self.active.remove(&code);
            false
        }
    }
}

/// Threshold and stabilization alarms driven by [`AdminSettings`].
#[derive(Debug, Default)]
pub struct ThresholdAlarms {
    devices: DashMap<String, Mutex<DeviceAlarms>>,
}

impl ThresholdAlarms {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmEvaluator for ThresholdAlarms {
    fn evaluate(
        &self,
        serial: &str,
        admin: &AdminSettings,
        config: &ConfigSettings,
        sample: &SampleRecord,
    ) -> Vec<RaisedAlarm> {
        let entry = self.devices.entry(serial.to_string()).or_default();
        let mut state = entry.lock();
        let flow = sample.hi_flow.max(sample.lo_flow);

        // In code order.
        let checks = [
            (
                event_codes::ALARM_BATT_HIGH_AMP,
                sample.bat_amp > admin.batt_high_amp,
                format!("battery current {:.2} A > {:.2} A", sample.bat_amp, admin.batt_high_amp),
            ),
            (
                event_codes::ALARM_BATT_LOW_VOLT,
                sample.bat_volt < admin.batt_low_volt,
                format!("battery voltage {:.2} V < {:.2} V", sample.bat_volt, admin.batt_low_volt),
            ),
            (
                event_codes::ALARM_MOT_HIGH_VOLT,
                sample.mot_volt > admin.mot_high_volt,
                format!("motor voltage {:.2} V > {:.2} V", sample.mot_volt, admin.mot_high_volt),
            ),
            (
                event_codes::ALARM_MOT_LOW_VOLT,
                sample.mot_volt < admin.mot_low_volt,
                format!("motor voltage {:.2} V < {:.2} V", sample.mot_volt, admin.mot_low_volt),
            ),
            (
                event_codes::ALARM_HIGH_PRESS,
                sample.press > admin.high_press,
                format!("pressure {:.1} kPa > {:.1} kPa", sample.press, admin.high_press),
            ),
            (
                event_codes::ALARM_LOW_PRESS,
                sample.press < admin.low_press,
                format!("pressure {:.1} kPa < {:.1} kPa", sample.press, admin.low_press),
            ),
            (
                event_codes::ALARM_HIGH_FLOW,
                flow > admin.high_flow,
                format!("flow {:.2} > {:.2}", flow, admin.high_flow),
            ),
            (
                event_codes::ALARM_LOW_FLOW,
                flow < admin.low_flow,
                format!("flow {:.2} < {:.2}", flow, admin.low_flow),
            ),
        ];

        let mut raised = Vec::new();
        for (code, cond, msg) in checks {
            if state.edge(code, cond) {
                raised.push(RaisedAlarm { code, msg });
            }
        }

        // Shut-in: valve closed, pressure building until it plateaus.
        if config.valve_mode == ValveMode::Build {
            state.flow.clear();
            state.edge(event_codes::ALARM_FLOW_STABLE, false);
            state
                .press
                .push(sample.time, sample.press, admin.press_stable_window_ms);
            let stable = state
                .press
                .spread(admin.press_stable_window_ms)
                .is_some_and(|d| d <= admin.press_stable_delta);
            if state.edge(event_codes::ALARM_PRESS_STABLE, stable) {
                raised.push(RaisedAlarm {
                    code: event_codes::ALARM_PRESS_STABLE,
                    msg: format!("pressure stable at {:.1} kPa", sample.press),
                });
            }
        } else {
            state.press.clear();
            state.edge(event_codes::ALARM_PRESS_STABLE, false);
            if matches!(config.valve_mode, ValveMode::HiFlow | ValveMode::LoFlow) {
                state
                    .flow
                    .push(sample.time, flow, admin.flow_stable_window_ms);
                let stable = state
                    .flow
                    .spread(admin.flow_stable_window_ms)
                    .is_some_and(|d| d <= admin.flow_stable_delta);
                if state.edge(event_codes::ALARM_FLOW_STABLE, stable) {
                    raised.push(RaisedAlarm {
                        code: event_codes::ALARM_FLOW_STABLE,
                        msg: format!("flow stable at {:.2}", flow),
                    });
                }
            } else {
                state.flow.clear();
                state.edge(event_codes::ALARM_FLOW_STABLE, false);
            }
        }

        raised
    }

    fn reset(&self, serial: &str) {
        self.devices.remove(serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use des_core::models::Source;

    fn healthy(time: i64) -> SampleRecord {
        SampleRecord {
            time,
            press: 500.0,
            hi_flow: 10.0,
            bat_amp: 1.0,
            bat_volt: 12.6,
            mot_volt: 12.0,
            ..Default::default()
        }
    }

    fn settings() -> (AdminSettings, ConfigSettings) {
        (
            AdminSettings::defaults("A", Source::server(0)),
            ConfigSettings::defaults("A", Source::server(0)),
        )
    }

    #[test]
    fn test_threshold_is_edge_triggered() {
        let alarms = ThresholdAlarms::new();
        let (admin, config) = settings();

        assert!(alarms.evaluate("A", &admin, &config, &healthy(0)).is_empty());

        let mut hot = healthy(1);
        hot.press = admin.high_press + 1.0;
        let raised = alarms.evaluate("A", &admin, &config, &hot);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].code, event_codes::ALARM_HIGH_PRESS);

        // Still high: no repeat.
        assert!(alarms.evaluate("A", &admin, &config, &hot).is_empty());

        // Clears, then re-arms.
        assert!(alarms.evaluate("A", &admin, &config, &healthy(2)).is_empty());
        assert_eq!(alarms.evaluate("A", &admin, &config, &hot).len(), 1);
    }

    #[test]
    fn test_devices_are_independent() {
        let alarms = ThresholdAlarms::new();
        let (admin, config) = settings();
        let mut low = healthy(0);
        low.bat_volt = 9.0;
        assert_eq!(alarms.evaluate("A", &admin, &config, &low).len(), 1);
        assert_eq!(alarms.evaluate("B", &admin, &config, &low).len(), 1);
        alarms.reset("A");
        assert_eq!(alarms.evaluate("A", &admin, &config, &low).len(), 1);
    }

    #[test]
    fn test_shut_in_pressure_stabilizes() {
        let alarms = ThresholdAlarms::new();
        let (mut admin, mut config) = settings();
        admin.press_stable_window_ms = 1000;
        admin.press_stable_delta = 1.0;
        config.valve_mode = ValveMode::Build;

        let mut raised = Vec::new();
        for (i, press) in [100.0, 200.0, 300.0, 300.2, 300.4, 300.5, 300.6].iter().enumerate() {
            let mut s = healthy(i as i64 * 500);
            s.press = *press;
            raised.extend(alarms.evaluate("A", &admin, &config, &s));
        }
        let stable: Vec<_> = raised
            .iter()
            .filter(|a| a.code == event_codes::ALARM_PRESS_STABLE)
            .collect();
        assert_eq!(stable.len(), 1);
    }

    #[test]
    fn test_extreme_sample_times() {
        let alarms = ThresholdAlarms::new();
        let (mut admin, mut config) = settings();
        admin.press_stable_window_ms = 1000;
        config.valve_mode = ValveMode::Build;

        for time in [i64::MIN, i64::MAX, i64::MIN, 0, i64::MAX] {
            alarms.evaluate("A", &admin, &config, &healthy(time));
        }

        config.valve_mode = ValveMode::HiFlow;
        admin.flow_stable_window_ms = i64::MAX;
        for time in [i64::MIN, i64::MAX] {
            alarms.evaluate("A", &admin, &config, &healthy(time));
        }
    }

    #[test]
    fn test_threshold_alarms_in_code_order() {
        let alarms = ThresholdAlarms::new();
        let (admin, config) = settings();
        let mut bad = healthy(0);
        bad.bat_amp = admin.batt_high_amp + 1.0;
        bad.press = admin.high_press + 1.0;
        bad.hi_flow = admin.high_flow + 1.0;
        let codes: Vec<i32> = alarms
            .evaluate("A", &admin, &config, &bad)
            .into_iter()
            .map(|a| a.code)
            .collect();
        assert_eq!(
            codes,
            vec![
                event_codes::ALARM_BATT_HIGH_AMP,
                event_codes::ALARM_HIGH_PRESS,
                event_codes::ALARM_HIGH_FLOW,
            ]
        );
    }

    #[test]
    fn test_flow_stable_needs_open_valve() {
        let alarms = ThresholdAlarms::new();
        let (mut admin, mut config) = settings();
        admin.flow_stable_window_ms = 1000;
        config.valve_mode = ValveMode::Vent;

        for i in 0..10 {
            let raised = alarms.evaluate("A", &admin, &config, &healthy(i * 500));
            assert!(raised.is_empty());
        }

        config.valve_mode = ValveMode::HiFlow;
        let raised: Vec<_> = (10..20)
            .flat_map(|i| alarms.evaluate("A", &admin, &config, &healthy(i * 500)))
            .collect();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].code, event_codes::ALARM_FLOW_STABLE);
    }
}
