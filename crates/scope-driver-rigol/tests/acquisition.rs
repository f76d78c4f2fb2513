//! Integration tests for the RIGOL driver against the simulated scope.
//!
//! These tests cover settings read-back, the start sequence, trigger
//! detection with failure counting, waveform acquisition and client setters.

#![allow(clippy::unwrap_used, clippy::float_cmp, clippy::panic)]

use async_trait::async_trait;
use chrono::Utc;
use scope_core::pv::PvValue;
use scope_core::registry::{PutRequest, PvRegistry};
use scope_core::state::{ServerCommand, ServerState};
use scope_driver_rigol::mock::MOCK_IDN;
use scope_driver_rigol::{
    Catalogue, DriverError, DriverOptions, Fault, MockScope, RigolScope, ScpiError, ScpiTransport,
};
use std::sync::Arc;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    mock: Arc<MockScope>,
    registry: Arc<PvRegistry>,
    scope: RigolScope,
}

fn harness(channels: usize) -> Harness {
    let mock = Arc::new(MockScope::new());
    let catalogue = Catalogue::build("TCPIP::127.0.0.1::INSTR", channels);
    let registry = Arc::new(catalogue.registry("rigol0:", "test", 0.01, 0).unwrap());
    let transport: Arc<dyn ScpiTransport> = mock.clone();
    let scope = RigolScope::new(
        transport,
        Arc::clone(&registry),
        catalogue.setters(),
        DriverOptions {
            channels,
            error_count_limit: 2,
        },
    );
    Harness {
        mock,
        registry,
        scope,
    }
}

async fn initialized(channels: usize) -> Harness {
    let mut h = harness(channels);
    h.scope.init().await.unwrap();
    h
}

fn put(h: &Harness, name: &str, value: impl Into<PvValue>) -> PutRequest {
    let value = h.registry.pv(name).unwrap().validate_put(&value.into()).unwrap();
    PutRequest {
        name: name.to_string(),
        value,
        received: Utc::now(),
    }
}

fn f64_of(reg: &PvRegistry, name: &str) -> f64 {
    reg.pvv(name).unwrap().as_f64().unwrap()
}

fn str_of(reg: &PvRegistry, name: &str) -> String {
    reg.pvv(name).unwrap().as_str().unwrap().to_string()
}

fn status(reg: &PvRegistry) -> String {
    str_of(reg, "status")
}

// =============================================================================
// Initialization
// =============================================================================

#[tokio::test]
async fn test_init_adopts_scope_settings() {
    let h = initialized(4).await;

    assert!(h
        .scope
        .settings_query()
        .starts_with(":ACQ:MDEP?;:ACQ:SRAT?;:TIM:SCAL?;:TRIG:MODE?"));
    assert!(h.scope.settings_query().ends_with(":CHAN4:OFFS?"));

    assert_eq!(f64_of(&h.registry, "timePerDiv"), 1e-6);
    assert_eq!(f64_of(&h.registry, "recLengthR"), 1200.0);
    assert!((f64_of(&h.registry, "samplingRate") - 1.2e8).abs() < 1.0);
    assert_eq!(str_of(&h.registry, "trigMode"), "AUTO");
    assert_eq!(str_of(&h.registry, "trigSource"), "CHAN1");
    assert_eq!(str_of(&h.registry, "c01OnOff"), "1");
    assert_eq!(str_of(&h.registry, "c03OnOff"), "0");
    assert_eq!(f64_of(&h.registry, "c02VoltsPerDiv"), 1.0);

    let history = h.mock.history();
    assert_eq!(history[0], "*IDN?");
    assert_eq!(history[1], "*CLS");
    assert!(history.contains(&":TRIG:EDGE:LEV?".to_string()));
}

struct OtherVendor;

#[async_trait]
impl ScpiTransport for OtherVendor {
    async fn write(&self, _command: &str) -> Result<(), ScpiError> {
        Ok(())
    }
    async fn query(&self, _query: &str) -> Result<String, ScpiError> {
        Ok("KEYSIGHT TECHNOLOGIES,DSOX1204G,CN0000,1.0".to_string())
    }
    async fn query_binary(&self, query: &str) -> Result<Vec<u16>, ScpiError> {
        Err(ScpiError::Protocol(query.to_string()))
    }
    async fn clear(&self) -> Result<(), ScpiError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_init_rejects_other_vendors() {
    let catalogue = Catalogue::build("x", 1);
    let registry = Arc::new(catalogue.registry("rigol0:", "test", 0.01, 0).unwrap());
    let mut scope = RigolScope::new(
        Arc::new(OtherVendor),
        registry,
        catalogue.setters(),
        DriverOptions::default(),
    );
    assert!(matches!(scope.init().await, Err(DriverError::NotRigol(_))));
}

#[tokio::test]
async fn test_init_reports_unanswered_mnemonic() {
    let h = harness(1);
    let mut scope = h.scope;
    scope.identify().await.unwrap();
    // The first SCPI-bound PV is recLengthR.
    h.mock.inject(Fault::Timeout, 1);
    let err = scope.make_settings_query().await.unwrap_err();
    match err {
        DriverError::InvalidScpi { pv, scpi, .. } => {
            assert_eq!(pv, "recLengthR");
            assert_eq!(scpi, "ACQ:MDEP");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_front_panel_change_is_adopted() {
    let mut h = initialized(2).await;
    h.mock.set("TIM:SCAL", "5.000000e-04");
    h.mock.set("CHAN2:COUP", "AC");
    h.scope.adopt_local_setting().await.unwrap();
    assert_eq!(f64_of(&h.registry, "timePerDiv"), 5e-4);
    assert_eq!(str_of(&h.registry, "c02Coupling"), "AC");
}

#[tokio::test]
async fn test_unconvertible_setting_is_an_error() {
    let mut h = initialized(1).await;
    h.mock.set("TIM:OFFS", "not-a-number");
    let err = h.scope.adopt_local_setting().await.unwrap_err();
    assert!(matches!(err, DriverError::Conversion { ref pv, .. } if pv == "trigDelay"));
}

// =============================================================================
// Start sequence and parameters
// =============================================================================

#[tokio::test]
async fn test_start_configures_transfer_and_runs() {
    let mut h = initialized(2).await;
    h.mock.press_stop();
    h.scope.on_start().await.unwrap();

    assert!(h.mock.is_running());
    assert_eq!(h.mock.setting("WAV:FORM").as_deref(), Some("WORD"));
    assert_eq!(h.mock.setting("WAV:MODE").as_deref(), Some("RAW"));
    assert_eq!(h.mock.setting("SAVE:OVER").as_deref(), Some("ON"));
    assert_eq!(h.scope.take_server_request(), None);
}

#[tokio::test]
async fn test_scope_parameters_update() {
    let mut h = initialized(4).await;
    h.scope.update_scope_parameters().await.unwrap();

    assert_eq!(h.scope.enabled_channels(), &[1, 2]);
    let horizontal = h.scope.horizontal();
    assert_eq!(horizontal.points, 1200);

    let t_axis = h.registry.pvv("tAxis").unwrap();
    match t_axis {
        PvValue::FloatArray(t) => {
            assert_eq!(t.len(), 1200);
            assert!((t[0] + 5e-6).abs() < 1e-15);
        }
        other => panic!("tAxis is {:?}", other),
    }
    assert!((f64_of(&h.registry, "timePerDiv") - 1e-6).abs() < 1e-15);

    h.mock.set("CHAN3:DISP", "1");
    h.mock.set("TRIG:EDGE:LEV", "0.25");
    h.scope.update_scope_parameters().await.unwrap();
    assert_eq!(h.scope.enabled_channels(), &[1, 2, 3]);
    assert_eq!(str_of(&h.registry, "c03OnOff"), "1");
    assert_eq!(f64_of(&h.registry, "trigLevel"), 0.25);
}

// =============================================================================
// Trigger detection and acquisition
// =============================================================================

#[tokio::test]
async fn test_trigger_and_acquisition() {
    let mut h = initialized(2).await;
    h.scope.update_scope_parameters().await.unwrap();

    assert!(!h.scope.detect_trigger().await.unwrap());
    assert_eq!(str_of(&h.registry, "trigState"), "WAIT");

    h.mock.arm_trigger();
    h.scope.poll().await.unwrap();

    assert_eq!(h.scope.acquisitions(), 1);
    assert_eq!(h.registry.pvv("acqCount").unwrap(), PvValue::Int(1));
    assert!(h.mock.is_running());

    for (ch, amplitude) in [(1, 0.5), (2, 1.0)] {
        let waveform = h.registry.pvv(&format!("c{:02}Waveform", ch)).unwrap();
        let PvValue::FloatArray(v) = waveform else {
            panic!("waveform is not an array");
        };
        assert_eq!(v.len(), 1200);
        let ptp = f64_of(&h.registry, &format!("c{:02}Peak2Peak", ch));
        assert!((ptp - 2.0 * amplitude).abs() < 1e-3, "ptp {} on {}", ptp, ch);
        assert!(f64_of(&h.registry, &format!("c{:02}Mean", ch)).abs() < 1e-3);
    }

    let history = h.mock.history();
    let stop = history.iter().position(|c| c == ":STOP").unwrap();
    let source2 = history
        .iter()
        .position(|c| c == "WAV:SOURce CHANnel2")
        .unwrap();
    let run = history.iter().rposition(|c| c == ":RUN").unwrap();
    assert!(stop < source2 && source2 < run);

    let timing = h.scope.timing();
    assert!(timing.acquire_wf >= timing.query_wf);
    assert_eq!(timing.to_vec().len(), 5);
}

#[tokio::test]
async fn test_waveform_includes_offset() {
    let mut h = initialized(1).await;
    h.scope.update_scope_parameters().await.unwrap();
    h.scope
        .apply_put(put(&h, "c01VoltOffset", 0.25), ServerState::Stopped)
        .await
        .unwrap();

    h.mock.arm_trigger();
    h.scope.poll().await.unwrap();

    let PvValue::FloatArray(v) = h.registry.pvv("c01Waveform").unwrap() else {
        panic!("waveform is not an array");
    };
    let mean = v.iter().sum::<f64>() / v.len() as f64;
    assert!((mean - 0.25).abs() < 1e-3);
    assert!(f64_of(&h.registry, "c01Mean").abs() < 1e-3);
}

#[tokio::test]
async fn test_transport_error_skips_remaining_channels() {
    let mut h = initialized(2).await;
    h.scope.update_scope_parameters().await.unwrap();
    let untouched = h.registry.pvv("c02Waveform").unwrap();

    h.mock.inject_on(":WAV:PRE?", Fault::Timeout);
    h.mock.arm_trigger();
    h.scope.poll().await.unwrap();

    assert_eq!(h.registry.pvv("c02Waveform").unwrap(), untouched);
    assert!(status(&h.registry).contains("Transport error in getting preamble for channel 1"));

    let history = h.mock.history();
    assert!(!history.iter().any(|c| c == "WAV:SOURce CHANnel2"));
    let source1 = history
        .iter()
        .position(|c| c == "WAV:SOURce CHANnel1")
        .unwrap();
    let run = history.iter().rposition(|c| c == ":RUN").unwrap();
    assert!(source1 < run);
    assert!(h.mock.is_running());
}

#[tokio::test]
async fn test_malformed_preamble_skips_only_its_channel() {
    let mut h = initialized(2).await;
    h.scope.update_scope_parameters().await.unwrap();
    let untouched = h.registry.pvv("c01Waveform").unwrap();

    h.mock.reply_once(":WAV:PRE?", "garbage");
    h.mock.arm_trigger();
    h.scope.poll().await.unwrap();

    assert_eq!(h.registry.pvv("c01Waveform").unwrap(), untouched);
    assert!(status(&h.registry).contains("Exception in getting preamble of channel 1"));
    let PvValue::FloatArray(v) = h.registry.pvv("c02Waveform").unwrap() else {
        panic!("waveform is not an array");
    };
    assert_eq!(v.len(), 1200);
    assert!((f64_of(&h.registry, "c02Peak2Peak") - 2.0).abs() < 1e-3);
    assert!(h.mock.is_running());
}

#[tokio::test]
async fn test_external_stop_requests_server_stop() {
    let mut h = initialized(1).await;
    h.mock.press_stop();
    assert!(!h.scope.detect_trigger().await.unwrap());
    assert_eq!(h.scope.take_server_request(), Some(ServerCommand::Stop));
    assert_eq!(str_of(&h.registry, "trigState"), "STOP");
    assert!(status(&h.registry).starts_with("WAR_@"));
}

#[tokio::test]
async fn test_repeated_timeouts_request_exit() {
    let mut h = initialized(1).await;

    h.mock.inject(Fault::Timeout, 1);
    assert!(!h.scope.detect_trigger().await.unwrap());
    assert_eq!(h.scope.take_server_request(), None);
    assert!(status(&h.registry).ends_with("Exception #1 during processing: VI_ERROR_TMO"));

    // A good reply clears the count.
    assert!(!h.scope.detect_trigger().await.unwrap());
    h.mock.inject(Fault::Timeout, 1);
    assert!(!h.scope.detect_trigger().await.unwrap());
    assert_eq!(h.scope.take_server_request(), None);

    h.mock.inject(Fault::Timeout, 1);
    assert!(!h.scope.detect_trigger().await.unwrap());
    assert_eq!(h.scope.take_server_request(), Some(ServerCommand::Exit));
    assert!(status(&h.registry).contains("Processing stopped due to VI_ERROR_TMO happened 2 times"));
}

#[tokio::test]
async fn test_lost_connection_is_fatal() {
    let mut h = initialized(1).await;
    h.mock.inject(Fault::Disconnect, 1);
    let err = h.scope.detect_trigger().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_scope_left_stopped_requests_stop() {
    let mut h = initialized(1).await;
    h.mock.press_stop();
    assert!(!h.scope.wait_for_ready().await.unwrap());
    assert_eq!(h.scope.take_server_request(), Some(ServerCommand::Stop));
    assert!(status(&h.registry).contains("Scope still stopped 0.4 seconds"));
}

// =============================================================================
// Setters
// =============================================================================

#[tokio::test]
async fn test_scpi_setter_writes_full_mnemonic() {
    let mut h = initialized(2).await;
    h.scope
        .apply_put(put(&h, "c02VoltsPerDiv", 0.5), ServerState::Started)
        .await
        .unwrap();
    assert!(h.mock.history().contains(&"CHANnel2:SCALe 0.5".to_string()));
    assert_eq!(h.mock.setting("CHAN2:SCAL").as_deref(), Some("0.5"));
    assert_eq!(f64_of(&h.registry, "c02VoltsPerDiv"), 0.5);

    h.scope
        .apply_put(put(&h, "trigMode", "NORM"), ServerState::Started)
        .await
        .unwrap();
    assert_eq!(h.mock.setting("TRIG:SWE").as_deref(), Some("NORM"));
    assert_eq!(str_of(&h.registry, "trigMode"), "NORM");
}

#[tokio::test]
async fn test_instrument_command() {
    let mut h = initialized(1).await;
    h.scope
        .apply_put(put(&h, "instrCmdS", "*IDN?"), ServerState::Stopped)
        .await
        .unwrap();
    assert_eq!(str_of(&h.registry, "instrCmdR"), MOCK_IDN);
    assert_eq!(str_of(&h.registry, "instrCmdS"), "*IDN?");

    h.scope
        .apply_put(put(&h, "instrCmdS", ":BOGus?"), ServerState::Stopped)
        .await
        .unwrap();
    assert_eq!(str_of(&h.registry, "instrCmdR"), "");
    assert!(status(&h.registry).ends_with("ERR:VI_ERROR_TMO: in scope_cmd(:BOGus?)"));
    assert_eq!(h.mock.history().last().map(String::as_str), Some("*CLS"));
}

#[tokio::test]
async fn test_setup_save_and_recall() {
    let mut h = initialized(1).await;

    h.scope
        .apply_put(put(&h, "setup", "Save latest"), ServerState::Stopped)
        .await
        .unwrap();
    assert!(h.mock.history().contains(&"SAVE:SETup C:/latest.stp".to_string()));
    assert_eq!(str_of(&h.registry, "setup"), "Setup");
    assert_eq!(status(&h.registry), "Setup was saved to C:/latest.stp");

    h.mock.set("TIM:SCAL", "5.000000e-04");
    h.scope.adopt_local_setting().await.unwrap();
    assert_eq!(f64_of(&h.registry, "timePerDiv"), 5e-4);

    h.scope
        .apply_put(put(&h, "setup", "Recall latest"), ServerState::Started)
        .await
        .unwrap();
    assert!(!h.mock.history().iter().any(|c| c.starts_with("LOAD:SETUp")));
    assert!(status(&h.registry).ends_with("Please set server to Stop before Recalling"));
    assert_eq!(str_of(&h.registry, "setup"), "Setup");

    h.scope
        .apply_put(put(&h, "setup", "Recall latest"), ServerState::Stopped)
        .await
        .unwrap();
    assert_eq!(status(&h.registry), "Setup was recalled from C:/latest.stp");
    assert_eq!(f64_of(&h.registry, "timePerDiv"), 1e-6);
}

#[tokio::test]
async fn test_force_trigger_and_record_length() {
    let mut h = initialized(1).await;

    h.scope
        .apply_put(put(&h, "trigger", "Force!"), ServerState::Started)
        .await
        .unwrap();
    assert!(h.mock.history().contains(&"TFORce".to_string()));
    assert_eq!(str_of(&h.registry, "trigger"), "Trigger");
    assert!(h.scope.detect_trigger().await.unwrap());

    h.scope
        .apply_put(put(&h, "recLengthS", "10k"), ServerState::Started)
        .await
        .unwrap();
    assert!(h.mock.history().contains(&"ACQuire:MDEPth 10k".to_string()));
    assert_eq!(str_of(&h.registry, "recLengthS"), "10k");
    assert_eq!(f64_of(&h.registry, "recLengthR"), 10_000.0);
    assert_eq!(h.scope.horizontal().points, 10_000);
}

#[tokio::test]
async fn test_put_without_setter_is_posted() {
    let mut h = initialized(1).await;
    h.scope
        .apply_put(put(&h, "instrCtrl", "*RST"), ServerState::Stopped)
        .await
        .unwrap();
    assert_eq!(str_of(&h.registry, "instrCtrl"), "*RST");
    assert!(!h.mock.history().contains(&"*RST".to_string()));
}

#[tokio::test]
async fn test_clear_resets_counters() {
    let mut h = initialized(1).await;
    h.scope.update_scope_parameters().await.unwrap();
    h.mock.arm_trigger();
    h.scope.poll().await.unwrap();
    assert_eq!(h.registry.pvv("acqCount").unwrap(), PvValue::Int(1));

    h.scope.on_clear().unwrap();
    assert_eq!(h.registry.pvv("acqCount").unwrap(), PvValue::Int(0));
    assert_eq!(h.registry.pvv("lostTrigs").unwrap(), PvValue::Int(0));
}
