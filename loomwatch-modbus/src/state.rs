//! Per-machine run/stop state and the transition applied on every decoded frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::TransportKind;
use crate::profile::{DeviceProfile, Fields, StopCategory};

/// Stops shorter than this are recorded but not counted.
pub const MIN_COUNTED_STOP_SECS: u64 = 60;

/// A finished stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    /// When the stop began; unknown if the stop predates any observation.
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Whole seconds, never negative.
    pub duration: u64,
    /// Taken from the bucket holding the event when read back.
    #[serde(default)]
    pub category: StopCategory,
}

/// Stop events grouped by category, append-only until the next shift reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStopBuckets")]
pub struct StopBuckets {
    #[serde(default)]
    warp: Vec<StopEvent>,
    #[serde(default)]
    weft: Vec<StopEvent>,
    #[serde(default)]
    feeder: Vec<StopEvent>,
    #[serde(default)]
    manual: Vec<StopEvent>,
    #[serde(default)]
    other: Vec<StopEvent>,
}

/// Buckets as they arrive from the collector, before categories are restored.
#[derive(Deserialize)]
struct RawStopBuckets {
    #[serde(default)]
    warp: Vec<StopEvent>,
    #[serde(default)]
    weft: Vec<StopEvent>,
    #[serde(default)]
    feeder: Vec<StopEvent>,
    #[serde(default)]
    manual: Vec<StopEvent>,
    #[serde(default)]
    other: Vec<StopEvent>,
}

impl From<RawStopBuckets> for StopBuckets {
    fn from(raw: RawStopBuckets) -> Self {
        let tag = |events: Vec<StopEvent>, category: StopCategory| -> Vec<StopEvent> {
            events
                .into_iter()
                .map(|event| StopEvent { category, ..event })
                .collect()
        };

        Self {
            warp: tag(raw.warp, StopCategory::Warp),
            weft: tag(raw.weft, StopCategory::Weft),
            feeder: tag(raw.feeder, StopCategory::Feeder),
            manual: tag(raw.manual, StopCategory::Manual),
            other: tag(raw.other, StopCategory::Other),
        }
    }
}

impl StopBuckets {
    fn bucket_mut(&mut self, category: StopCategory) -> &mut Vec<StopEvent> {
        match category {
            StopCategory::Warp => &mut self.warp,
            StopCategory::Weft => &mut self.weft,
            StopCategory::Feeder => &mut self.feeder,
            StopCategory::Manual => &mut self.manual,
            StopCategory::Other => &mut self.other,
        }
    }

    /// Events recorded for one category, oldest first.
    pub fn get(&self, category: StopCategory) -> &[StopEvent] {
        match category {
            StopCategory::Warp => &self.warp,
            StopCategory::Weft => &self.weft,
            StopCategory::Feeder => &self.feeder,
            StopCategory::Manual => &self.manual,
            StopCategory::Other => &self.other,
        }
    }

    /// Append an event to the bucket of its category.
    pub fn push(&mut self, event: StopEvent) {
        self.bucket_mut(event.category).push(event);
    }

    pub fn clear(&mut self) {
        for category in StopCategory::ALL {
            self.bucket_mut(category).clear();
        }
    }

    /// Total events across all categories.
    pub fn len(&self) -> usize {
        StopCategory::ALL.iter().map(|c| self.get(*c).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derived state of one loom.
///
/// Serialized field names follow the collector's log schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// Stop code of the last decoded frame, 0 while running.
    #[serde(rename = "stop", default)]
    pub current_stop_code: u16,

    #[serde(rename = "lastStopTime", default)]
    pub last_stop_time: Option<DateTime<Utc>>,

    #[serde(rename = "lastStartTime", default)]
    pub last_start_time: Option<DateTime<Utc>>,

    /// Stops of at least [`MIN_COUNTED_STOP_SECS`] in the current shift.
    #[serde(rename = "stopCount", default)]
    pub stop_event_count: u32,

    #[serde(rename = "stopsData", default)]
    pub stops_by_category: StopBuckets,

    #[serde(default)]
    pub shift: Option<u16>,

    /// Latest unit-adjusted register window.
    #[serde(rename = "rawData", default)]
    pub raw_snapshot: Vec<f64>,

    /// State as it stood when the last shift ended; cleared once published.
    #[serde(rename = "prevData", default)]
    pub previous_shift_snapshot: Option<Box<MachineState>>,
}

impl MachineState {
    pub fn is_running(&self) -> bool {
        self.current_stop_code == 0
    }
}

/// Edge detected by a single update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transition {
    /// First frame for this machine, loom running.
    FirstRunning,
    /// First frame for this machine, loom stopped.
    FirstStopped,
    Started,
    Stopped,
    #[default]
    Unchanged,
}

/// What an update changed, for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub transition: Transition,
    /// Stop finalised by this update.
    pub finished_stop: Option<StopEvent>,
    /// `(old, new)` shift ids when a boundary was crossed.
    pub shift_change: Option<(u16, u16)>,
}

/// Transition function for one profile and link kind.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine<'a> {
    profile: &'a DeviceProfile,
    transport: TransportKind,
}

impl<'a> StateMachine<'a> {
    pub fn new(profile: &'a DeviceProfile, transport: TransportKind) -> Self {
        Self { profile, transport }
    }

    pub fn profile(&self) -> &'a DeviceProfile {
        self.profile
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Apply a decoded frame observed at `now`.
    ///
    /// `slot` is `None` until the first frame for the machine; the state is
    /// created here. `snapshot` is the unit-adjusted register window.
    pub fn update(
        &self,
        slot: &mut Option<MachineState>,
        fields: &Fields,
        snapshot: Vec<f64>,
        now: DateTime<Utc>,
    ) -> Update {
        let stop_code = self.profile.effective_stop_code(fields);
        let previous = slot.as_ref().map(|s| s.current_stop_code);
        let state = slot.get_or_insert_with(MachineState::default);
        let mut update = Update::default();

        match previous {
            None if stop_code != 0 => {
                state.last_stop_time = Some(now);
                update.transition = Transition::FirstStopped;
            }
            None => {
                state.last_start_time = Some(now);
                update.transition = Transition::FirstRunning;
            }
            Some(0) if stop_code != 0 => {
                state.last_stop_time = Some(now);
                update.transition = Transition::Stopped;
            }
            Some(previous) if previous != 0 && stop_code == 0 => {
                state.last_start_time = Some(now);
                update.finished_stop = Some(self.finish_stop(state, previous, now));
                update.transition = Transition::Started;
            }
            Some(_) => {}
        }

        if let (Some(previous), Some(known)) = (previous, state.shift) {
            if known != fields.shift {
                if previous != 0 && stop_code != 0 {
                    // Split a stop that straddles the boundary between the two shifts
                    update.finished_stop = Some(self.finish_stop(state, previous, now));
                    state.last_stop_time = Some(now);
                }

                let mut closed = state.clone();
                closed.previous_shift_snapshot = None;
                state.previous_shift_snapshot = Some(Box::new(closed));

                state.stop_event_count = 0;
                state.stops_by_category.clear();

                if previous == 0 && stop_code == 0 {
                    state.last_start_time = Some(now);
                }
                update.shift_change = Some((known, fields.shift));
            }
        }

        state.current_stop_code = stop_code;
        state.raw_snapshot = snapshot;
        state.shift = Some(fields.shift);

        update
    }

    /// Close the stop that began at `state.last_stop_time`.
    fn finish_stop(&self, state: &mut MachineState, code: u16, now: DateTime<Utc>) -> StopEvent {
        let duration = state
            .last_stop_time
            .map(|start| elapsed_secs(start, now))
            .unwrap_or(0);

        if state.last_stop_time.is_some() && duration >= MIN_COUNTED_STOP_SECS {
            state.stop_event_count += 1;
        }

        let event = StopEvent {
            start: state.last_stop_time,
            end: now,
            status_code: code,
            duration,
            category: self.profile.classify(code),
        };
        state.stops_by_category.push(event.clone());
        event
    }
}

/// Whole seconds from `start` to `end`, clamped at zero.
fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let secs = (end - start).num_seconds();
    if secs < 0 {
        warn!(start = %start, end = %end, "Stop ends before it starts; clamping duration to 0");
        return 0;
    }
    secs as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Frame, PROFILE_A, PROFILE_B};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    fn fields(stop_code: u16, shift: u16) -> Fields {
        Fields {
            stop_code,
            shift,
            speed: 0.0,
            cloth_length: 12.0,
            loom_state: 1,
        }
    }

    fn machine_a() -> StateMachine<'static> {
        StateMachine::new(&PROFILE_A, TransportKind::Tcp)
    }

    #[test]
    fn test_first_frame_running() {
        let mut slot = None;
        let update = machine_a().update(&mut slot, &fields(0, 1), vec![1.0], t0());

        let state = slot.unwrap();
        assert_eq!(update.transition, Transition::FirstRunning);
        assert_eq!(state.last_start_time, Some(t0()));
        assert_eq!(state.last_stop_time, None);
        assert_eq!(state.shift, Some(1));
        assert_eq!(state.raw_snapshot, vec![1.0]);
    }

    #[test]
    fn test_first_frame_stopped() {
        let mut slot = None;
        let update = machine_a().update(&mut slot, &fields(7, 1), vec![], t0());

        let state = slot.unwrap();
        assert_eq!(update.transition, Transition::FirstStopped);
        assert_eq!(state.last_stop_time, Some(t0()));
        assert_eq!(state.current_stop_code, 7);
        assert!(state.stops_by_category.is_empty());
    }

    #[test]
    fn test_replaying_frame_is_idempotent() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(3, 1), vec![], t0());
        let before = slot.clone();

        for i in 1..5 {
            let now = t0() + Duration::seconds(i);
            let update = machine.update(&mut slot, &fields(3, 1), vec![], now);
            assert_eq!(update.transition, Transition::Unchanged);
            assert!(update.finished_stop.is_none());
        }

        assert_eq!(slot, before);
    }

    #[test]
    fn test_short_stop_recorded_but_not_counted() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![], t0());
        machine.update(&mut slot, &fields(1, 1), vec![], t0() + Duration::seconds(10));
        let update = machine.update(&mut slot, &fields(0, 1), vec![], t0() + Duration::seconds(69));

        let state = slot.unwrap();
        let event = update.finished_stop.unwrap();
        assert_eq!(event.duration, 59);
        assert_eq!(event.category, StopCategory::Warp);
        assert_eq!(state.stop_event_count, 0);
        assert_eq!(state.stops_by_category.get(StopCategory::Warp).len(), 1);
        assert_eq!(state.last_start_time, Some(t0() + Duration::seconds(69)));
    }

    #[test]
    fn test_long_stop_counted() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![], t0());
        machine.update(&mut slot, &fields(6, 1), vec![], t0() + Duration::seconds(10));
        machine.update(&mut slot, &fields(0, 1), vec![], t0() + Duration::seconds(70));

        let state = slot.unwrap();
        let manual = state.stops_by_category.get(StopCategory::Manual);
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].duration, 60);
        assert_eq!(manual[0].start, Some(t0() + Duration::seconds(10)));
        assert_eq!(manual[0].end, t0() + Duration::seconds(70));
        assert_eq!(manual[0].status_code, 6);
        assert_eq!(state.stop_event_count, 1);
    }

    #[test]
    fn test_profile_a_weft_scenario() {
        // One sample per tick at constant shift
        let machine = machine_a();
        let tick = Duration::seconds(1);
        let mut slot = None;
        let mut finished = Vec::new();

        for (i, code) in [0u16, 0, 3, 3, 0].into_iter().enumerate() {
            let now = t0() + tick * i as i32;
            let update = machine.update(&mut slot, &fields(code, 2), vec![], now);
            finished.extend(update.finished_stop);
        }

        let state = slot.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(state.stops_by_category.len(), 1);
        let weft = state.stops_by_category.get(StopCategory::Weft);
        assert_eq!(weft.len(), 1);
        assert_eq!(weft[0].status_code, 3);
        assert_eq!(weft[0].duration, 2);
        assert!(state.is_running());
    }

    #[test]
    fn test_unknown_code_goes_to_other() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(99, 1), vec![], t0());
        machine.update(&mut slot, &fields(0, 1), vec![], t0() + Duration::seconds(5));

        let state = slot.unwrap();
        assert_eq!(state.stops_by_category.get(StopCategory::Other).len(), 1);
    }

    #[test]
    fn test_profile_b_speed_override_keeps_running() {
        let machine = StateMachine::new(&PROFILE_B, TransportKind::Tcp);
        let mut slot = None;
        let moving = Fields {
            stop_code: 5,
            shift: 1,
            speed: 8.0,
            cloth_length: 3.0,
            loom_state: 1,
        };

        let update = machine.update(&mut slot, &moving, vec![], t0());

        let state = slot.unwrap();
        assert_eq!(update.transition, Transition::FirstRunning);
        assert_eq!(state.current_stop_code, 0);
        assert_eq!(state.last_start_time, Some(t0()));
    }

    #[test]
    fn test_shift_boundary_resets_counters() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![], t0());
        machine.update(&mut slot, &fields(4, 1), vec![], t0() + Duration::seconds(100));
        machine.update(&mut slot, &fields(0, 1), vec![], t0() + Duration::seconds(300));
        let at_boundary = slot.clone().unwrap();
        assert_eq!(at_boundary.stop_event_count, 1);

        let boundary = t0() + Duration::seconds(400);
        let update = machine.update(&mut slot, &fields(0, 2), vec![9.0], boundary);

        let state = slot.unwrap();
        assert_eq!(update.shift_change, Some((1, 2)));
        assert_eq!(state.stop_event_count, 0);
        assert!(state.stops_by_category.is_empty());
        assert_eq!(state.shift, Some(2));
        // Running across the boundary restarts the run clock
        assert_eq!(state.last_start_time, Some(boundary));
        assert_eq!(state.previous_shift_snapshot.as_deref(), Some(&at_boundary));
    }

    #[test]
    fn test_stop_straddling_shift_is_split() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![], t0());
        machine.update(&mut slot, &fields(2, 1), vec![], t0() + Duration::seconds(10));

        let boundary = t0() + Duration::seconds(130);
        let update = machine.update(&mut slot, &fields(2, 2), vec![], boundary);

        let state = slot.clone().unwrap();
        let first_half = update.finished_stop.unwrap();
        assert_eq!(first_half.duration, 120);
        assert_eq!(first_half.category, StopCategory::Weft);

        // The closed shift owns the first half of the stop
        let closed = state.previous_shift_snapshot.as_deref().unwrap();
        assert_eq!(closed.stop_event_count, 1);
        assert_eq!(closed.stops_by_category.get(StopCategory::Weft).len(), 1);
        assert_eq!(closed.shift, Some(1));

        // The new shift starts its own stop clock
        assert_eq!(state.last_stop_time, Some(boundary));
        assert_eq!(state.stop_event_count, 0);
        assert!(state.stops_by_category.is_empty());

        let end = boundary + Duration::seconds(30);
        let update = machine.update(&mut slot, &fields(0, 2), vec![], end);
        assert_eq!(update.finished_stop.unwrap().duration, 30);
    }

    #[test]
    fn test_stop_ending_on_boundary_keeps_event_in_closed_shift() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(7, 1), vec![], t0());
        let boundary = t0() + Duration::seconds(90);
        machine.update(&mut slot, &fields(0, 2), vec![], boundary);

        let state = slot.unwrap();
        let closed = state.previous_shift_snapshot.as_deref().unwrap();
        assert_eq!(closed.stops_by_category.get(StopCategory::Feeder).len(), 1);
        assert_eq!(closed.stop_event_count, 1);
        assert!(state.stops_by_category.is_empty());
        assert_eq!(state.last_start_time, Some(boundary));
    }

    #[test]
    fn test_snapshot_does_not_nest() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![], t0());
        machine.update(&mut slot, &fields(0, 2), vec![], t0() + Duration::seconds(1));
        machine.update(&mut slot, &fields(0, 3), vec![], t0() + Duration::seconds(2));

        let state = slot.unwrap();
        let closed = state.previous_shift_snapshot.as_deref().unwrap();
        assert_eq!(closed.shift, Some(2));
        assert!(closed.previous_shift_snapshot.is_none());
    }

    #[test]
    fn test_negative_duration_clamped() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(1, 1), vec![], t0());
        let update = machine.update(&mut slot, &fields(0, 1), vec![], t0() - Duration::seconds(30));

        assert_eq!(update.finished_stop.unwrap().duration, 0);
        assert_eq!(slot.unwrap().stop_event_count, 0);
    }

    #[test]
    fn test_seeded_stop_without_start_time() {
        let machine = machine_a();
        let mut slot = Some(MachineState {
            current_stop_code: 3,
            shift: Some(1),
            ..Default::default()
        });

        let update = machine.update(&mut slot, &fields(0, 1), vec![], t0());
        let event = update.finished_stop.unwrap();
        assert_eq!(event.start, None);
        assert_eq!(event.duration, 0);
        assert_eq!(slot.unwrap().stop_event_count, 0);
    }

    #[test]
    fn test_profile_scaling_flows_into_snapshot() {
        let machine = StateMachine::new(&PROFILE_A, TransportKind::Rs485);
        let mut registers = vec![0u16; 74];
        registers[19] = 5;
        registers[36] = 125;
        let frame = Frame::new(4999, registers);
        let decoded = PROFILE_A.fields(&frame, machine.transport()).unwrap();
        let adjusted = PROFILE_A.adjust(&frame, machine.transport());

        let mut slot = None;
        machine.update(&mut slot, &decoded, adjusted, t0());

        assert_eq!(slot.unwrap().raw_snapshot[36], 12.5);
    }

    #[test]
    fn test_wire_names() {
        let machine = machine_a();
        let mut slot = None;
        machine.update(&mut slot, &fields(0, 1), vec![1.5], t0());
        machine.update(&mut slot, &fields(3, 1), vec![1.5], t0() + Duration::seconds(1));
        machine.update(&mut slot, &fields(0, 1), vec![1.5], t0() + Duration::seconds(2));

        let json = serde_json::to_value(slot.unwrap()).unwrap();
        assert_eq!(json["stop"], 0);
        assert_eq!(json["stopCount"], 0);
        assert_eq!(json["shift"], 1);
        assert_eq!(json["rawData"][0], 1.5);
        assert!(json["prevData"].is_null());
        assert_eq!(json["stopsData"]["weft"][0]["statusCode"], 3);
        assert_eq!(json["stopsData"]["weft"][0]["duration"], 1);
        assert!(json["stopsData"]["warp"].as_array().unwrap().is_empty());
        assert!(json["lastStopTime"].is_string());
    }

    #[test]
    fn test_state_roundtrip_from_collector() {
        let json = r#"{
            "stop": 4,
            "lastStopTime": "2024-03-01T05:55:00Z",
            "lastStartTime": null,
            "stopCount": 2,
            "stopsData": { "warp": [], "weft": [], "feeder": [], "manual": [], "other": [] },
            "shift": 1
        }"#;

        let state: MachineState = serde_json::from_str(json).unwrap();
        assert_eq!(state.current_stop_code, 4);
        assert_eq!(state.stop_event_count, 2);
        assert!(state.raw_snapshot.is_empty());
        assert!(state.previous_shift_snapshot.is_none());
    }

    #[test]
    fn test_stop_events_without_category_take_bucket() {
        let json = r#"{
            "stop": 0,
            "stopCount": 1,
            "stopsData": {
                "weft": [{
                    "start": "2024-03-01T05:50:00Z",
                    "end": "2024-03-01T05:52:00Z",
                    "statusCode": 3,
                    "duration": 120
                }],
                "manual": [
                    { "start": null, "end": "2024-03-01T05:53:00Z", "statusCode": 6, "duration": 0 }
                ]
            },
            "shift": 1,
            "prevData": {
                "stopsData": {
                    "warp": [{ "end": "2024-03-01T05:40:00Z", "statusCode": 1, "duration": 61 }]
                },
                "shift": 3
            }
        }"#;

        let state: MachineState = serde_json::from_str(json).unwrap();
        let weft = state.stops_by_category.get(StopCategory::Weft);
        assert_eq!(weft.len(), 1);
        assert_eq!(weft[0].category, StopCategory::Weft);
        assert_eq!(weft[0].status_code, 3);
        assert_eq!(weft[0].duration, 120);
        let manual = state.stops_by_category.get(StopCategory::Manual);
        assert_eq!(manual[0].category, StopCategory::Manual);
        assert_eq!(manual[0].start, None);

        let closed = state.previous_shift_snapshot.as_deref().unwrap();
        let warp = closed.stops_by_category.get(StopCategory::Warp);
        assert_eq!(warp[0].category, StopCategory::Warp);
        assert_eq!(warp[0].start, None);
    }

    #[test]
    fn test_seeded_buckets_keep_growing() {
        let json = r#"{
            "stop": 3,
            "lastStopTime": "2024-03-01T05:59:00Z",
            "stopsData": {
                "weft": [
                    { "end": "2024-03-01T05:30:00Z", "statusCode": 3, "duration": 90 }
                ]
            },
            "shift": 1
        }"#;
        let mut slot = Some(serde_json::from_str::<MachineState>(json).unwrap());

        machine_a().update(&mut slot, &fields(0, 1), vec![], t0());

        let state = slot.unwrap();
        let weft = state.stops_by_category.get(StopCategory::Weft);
        assert_eq!(weft.len(), 2);
        assert_eq!(weft[1].duration, 60);
        assert_eq!(state.stop_event_count, 1);
    }
}
