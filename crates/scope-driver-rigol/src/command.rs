//! SCPI command text helpers.

/// Short form of a mnemonic: lowercase letters are dropped.
///
/// `TIMebase:SCALe` becomes `TIM:SCAL`, `CHANnel2:DISPlay` becomes
/// `CHAN2:DISP`.
pub fn abbreviate(mnemonic: &str) -> String {
    mnemonic.chars().filter(|c| !c.is_lowercase()).collect()
}

/// True if `command` expects a reply.
pub fn is_query(command: &str) -> bool {
    command.contains('?')
}

/// True for mnemonics that are not read back with the settings.
pub fn is_excluded_from_settings(mnemonic: &str) -> bool {
    mnemonic.starts_with('!') || mnemonic.starts_with('*')
}

/// Combine headers into one query rooted at the top of the command tree,
/// `:A?;:B?;:C?`.
pub fn combined_query<S: AsRef<str>>(headers: &[S]) -> String {
    headers
        .iter()
        .map(|h| {
            let h = h.as_ref();
            if h.starts_with(':') {
                format!("{}?", h)
            } else {
                format!(":{}?", h)
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Split a reply to a combined query.
pub fn split_reply(reply: &str) -> Vec<&str> {
    reply.split(';').map(str::trim).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("TIMebase:SCALe"), "TIM:SCAL");
        assert_eq!(abbreviate("CHANnel3:OFFSet"), "CHAN3:OFFS");
        assert_eq!(abbreviate("TRIGger:EDGE:LEVel"), "TRIG:EDGE:LEV");
        assert_eq!(abbreviate("*IDN"), "*IDN");
    }

    #[test]
    fn test_combined_query_and_split() {
        assert_eq!(
            combined_query(&["ACQ:MDEP", ":TIM:SCAL", "TRIG:STAT"]),
            ":ACQ:MDEP?;:TIM:SCAL?;:TRIG:STAT?"
        );
        assert_eq!(split_reply("12000; 1.0e-06;TD"), vec!["12000", "1.0e-06", "TD"]);
    }

    #[test]
    fn test_query_and_exclusion() {
        assert!(is_query("*IDN?"));
        assert!(!is_query("TFORce"));
        assert!(is_excluded_from_settings("*ESR"));
        assert!(is_excluded_from_settings("!VIRTUAL"));
        assert!(!is_excluded_from_settings("TIM:SCAL"));
    }
}
