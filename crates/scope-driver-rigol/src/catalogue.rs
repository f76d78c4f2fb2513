//! PVs served for a RIGOL scope.
//!
//! Instrument-wide PVs come first, then the channel templates expanded for
//! each channel. A PV with an SCPI mnemonic is read back from the scope with
//! the settings; a PV with a [`Setter`] runs driver code when a client
//! writes it.

use scope_core::registry::{framework_defs, PvDef, PvRegistry};
use scope_core::error::PvResult;
use std::collections::HashMap;

/// Choices of the `setup` PV.
pub const SETUP_CHOICES: [&str; 5] = ["Setup", "Save latest", "Save oper", "Recall latest", "Recall oper"];

/// Choices of the `recLengthS` PV.
pub const RECORD_LENGTHS: [&str; 9] = ["AUTO", "1k", "10k", "100k", "1M", "5M", "10M", "25M", "50M"];

/// Driver action bound to a writable PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setter {
    /// Save or recall an instrument setup.
    Setup,
    /// Send a free-form command.
    InstrCmd,
    /// Change the memory depth.
    RecLength,
    /// Force a trigger.
    Trigger,
    /// Write the PV's SCPI mnemonic.
    Scpi,
}

/// A PV definition and its setter, if any.
#[derive(Debug, Clone)]
pub struct ScopePv {
    /// Definition, possibly a channel template.
    pub def: PvDef,
    /// Setter applied on client puts.
    pub setter: Option<Setter>,
}

fn pv(def: PvDef) -> ScopePv {
    ScopePv { def, setter: None }
}

fn with_setter(def: PvDef, setter: Setter) -> ScopePv {
    ScopePv {
        def,
        setter: Some(setter),
    }
}

fn instrument_pvs(resource: &str) -> Vec<ScopePv> {
    use Setter::*;
    vec![
        with_setter(
            PvDef::choices(
                "setup",
                "Save/recall instrument state to/from latest or operational setup",
                &SETUP_CHOICES,
                "WD",
            ),
            Setup,
        ),
        pv(PvDef::new("visaResource", "VISA resource to access the device", resource, "R")),
        pv(PvDef::new("dateTime", "Scope`s date & time", "N/A", "R")),
        pv(PvDef::new("acqCount", "Number of acquisition recorded", 0i64, "R")),
        pv(PvDef::new("scopeAcqCount", "Acquisition count of the scope", 0i64, "R")),
        pv(PvDef::new("lostTrigs", "Number of triggers lost", 0i64, "R")),
        pv(PvDef::choices(
            "instrCtrl",
            "Scope control commands",
            &["*IDN?", "*RST", "*CLS", "*ESR?", "*OPC?", "*STB?"],
            "WD",
        )),
        with_setter(
            PvDef::new("instrCmdS", "Execute a scope command. Features: RWE", "*IDN?", "W"),
            InstrCmd,
        ),
        pv(PvDef::new("instrCmdR", "Response of the instrCmdS", "", "R")),
        // Horizontal
        with_setter(
            PvDef::choices("recLengthS", "Number of points per waveform", &RECORD_LENGTHS, "WD"),
            RecLength,
        ),
        pv(PvDef::new("recLengthR", "Number of points per waveform read", 0.0, "R")
            .with_scpi("ACQuire:MDEPth")),
        pv(PvDef::new("samplingRate", "Sampling Rate", 0.0, "R")
            .with_units("Hz")
            .with_scpi("ACQuire:SRATe")),
        with_setter(
            PvDef::new("timePerDiv", "Horizontal scale (1/10 of full scale)", 2.0e-6, "W")
                .with_units("S/du")
                .with_scpi("TIMebase:SCALe"),
            Scpi,
        ),
        pv(PvDef::new("tAxis", "Horizontal axis array", vec![0.0], "R").with_units("S")),
        // Trigger
        with_setter(
            PvDef::choices(
                "trigger",
                "Click to force trigger event to occur",
                &["Trigger", "Force!"],
                "WD",
            ),
            Trigger,
        ),
        with_setter(
            PvDef::choices("trigType", "Trigger ", &["EDGE", "PULS", "SLOP", "VID"], "WD")
                .with_scpi("TRIGger:MODE"),
            Scpi,
        ),
        with_setter(
            PvDef::choices("trigCoupling", "Trigger coupling", &["DC", "AC", "LFR", "HFR"], "WD")
                .with_scpi("TRIGger:COUPling"),
            Scpi,
        ),
        pv(PvDef::new(
            "trigState",
            "Current trigger status: TD,WAIT,RUN,AUTO and STOP",
            "?",
            "R",
        )
        .with_scpi("TRIGger:STATus")),
        with_setter(
            PvDef::choices("trigMode", "Trigger mode", &["NORM", "AUTO", "SING"], "WD")
                .with_scpi("TRIGger:SWEep"),
            Scpi,
        ),
        with_setter(
            PvDef::new("trigDelay", "Trigger position", 0.0, "W")
                .with_units("S")
                .with_scpi("TIMebase:OFFSet"),
            Scpi,
        ),
        with_setter(
            PvDef::choices(
                "trigSource",
                "Trigger source",
                &[
                    "CHAN1", "CHAN2", "CHAN3", "CHAN4", "EXT", "D0", "D1", "D2", "D3", "D4", "D5",
                    "D6", "D7",
                ],
                "WD",
            )
            .with_scpi("TRIGger:EDGE:SOURce"),
            Scpi,
        ),
        with_setter(
            PvDef::choices("trigSlope", "Trigger slope", &["POS", "NEG", "RFALI"], "WD")
                .with_scpi("TRIGger:EDGE:SLOPe"),
            Scpi,
        ),
        with_setter(
            PvDef::new("trigLevel", "Trigger level", 0.0, "W")
                .with_units("V")
                .with_scpi("TRIGger:EDGE:LEVel"),
            Scpi,
        ),
        // Auxiliary
        pv(PvDef::new("timing", "Performance timing", vec![0.0], "R").with_units("S")),
    ]
}

fn channel_templates() -> Vec<ScopePv> {
    use Setter::*;
    vec![
        with_setter(
            PvDef::choices("c<n>OnOff", "Enable/disable channel", &["1", "0"], "WD")
                .with_scpi("CHANnel<n>:DISPlay"),
            Scpi,
        ),
        with_setter(
            PvDef::choices("c<n>Coupling", "Channel coupling", &["DC", "AC", "GND"], "WD")
                .with_scpi("CHANnel<n>:COUPling"),
            Scpi,
        ),
        with_setter(
            PvDef::new("c<n>VoltsPerDiv", "Vertical scale", 1e-3, "W")
                .with_units("V/du")
                .with_scpi("CHANnel<n>:SCALe")
                .with_limits(500e-6, 10.0),
            Scpi,
        ),
        with_setter(
            PvDef::new("c<n>VoltOffset", "Vertical offset", 0.0, "W")
                .with_units("V")
                .with_scpi("CHANnel<n>:OFFSet"),
            Scpi,
        ),
        // Fixed on RIGOL.
        pv(PvDef::new("c<n>Termination", "Input termination", "1M", "R").with_units("Ohm")),
        pv(PvDef::new("c<n>Waveform", "Waveform array", vec![0.0], "R").with_units("du")),
        pv(PvDef::new("c<n>Mean", "Mean of the waveform", 0.0, "A").with_units("V")),
        pv(PvDef::new("c<n>Peak2Peak", "Peak-to-peak amplitude", 0.0, "A")
            .with_units("V")
            .with_alarm(-9.0, 9.0)),
    ]
}

/// PV definitions of a scope with `channels` channels, and their setters.
#[derive(Debug, Clone)]
pub struct Catalogue {
    pvs: Vec<ScopePv>,
}

impl Catalogue {
    /// Build the catalogue. Channel PVs are named `c01…`, `c02…` and so on.
    pub fn build(resource: &str, channels: usize) -> Self {
        let templates = channel_templates();
        let mut pvs = instrument_pvs(resource);
        for ch in 1..=channels {
            pvs.extend(templates.iter().map(|t| ScopePv {
                def: t.def.for_channel(ch),
                setter: t.setter,
            }));
        }
        Self { pvs }
    }

    /// Definitions in serving order.
    pub fn defs(&self) -> impl Iterator<Item = &PvDef> {
        self.pvs.iter().map(|p| &p.def)
    }

    /// Setter of each writable PV that has one.
    pub fn setters(&self) -> HashMap<String, Setter> {
        self.pvs
            .iter()
            .filter_map(|p| p.setter.map(|s| (p.def.name().to_string(), s)))
            .collect()
    }

    /// Registry holding the framework PVs followed by the catalogue.
    pub fn registry(&self, prefix: &str, version: &str, sleep_s: f64, verbose: u8) -> PvResult<PvRegistry> {
        PvRegistry::new(
            prefix,
            framework_defs(version, sleep_s, verbose)
                .into_iter()
                .chain(self.defs().cloned()),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_expansion() {
        let cat = Catalogue::build("TCPIP::10.0.0.2::INSTR", 2);
        let names: Vec<_> = cat.defs().map(|d| d.name().to_string()).collect();
        assert!(names.contains(&"c01OnOff".to_string()));
        assert!(names.contains(&"c02Peak2Peak".to_string()));
        assert!(!names.contains(&"c03OnOff".to_string()));
        assert!(!names.iter().any(|n| n.contains("<n>")));

        let def = cat.defs().find(|d| d.name() == "c02VoltsPerDiv").unwrap();
        assert_eq!(def.meta().scpi.as_deref(), Some("CHANnel2:SCALe"));
        assert_eq!(def.meta().limit_low, Some(500e-6));
    }

    #[test]
    fn test_setters() {
        let setters = Catalogue::build("x", 1).setters();
        assert_eq!(setters.get("setup"), Some(&Setter::Setup));
        assert_eq!(setters.get("instrCmdS"), Some(&Setter::InstrCmd));
        assert_eq!(setters.get("recLengthS"), Some(&Setter::RecLength));
        assert_eq!(setters.get("trigger"), Some(&Setter::Trigger));
        assert_eq!(setters.get("c01VoltOffset"), Some(&Setter::Scpi));
        assert_eq!(setters.get("instrCtrl"), None);
        assert_eq!(setters.get("tAxis"), None);
    }

    #[test]
    fn test_registry_includes_framework_pvs() {
        let reg = Catalogue::build("TCPIP::10.0.0.2::INSTR", 4)
            .registry("rigol0:", "v0.1.0", 0.1, 0)
            .unwrap();
        let names: Vec<_> = reg.names().collect();
        assert_eq!(names[0], "version");
        assert!(names.contains(&"server"));
        assert!(names.contains(&"c04Waveform"));
        let peak = reg.pv("c01Peak2Peak").unwrap();
        assert!(peak.meta().access.alarm);
        assert_eq!(
            reg.pvv("visaResource").unwrap().as_str(),
            Some("TCPIP::10.0.0.2::INSTR")
        );
    }
}
