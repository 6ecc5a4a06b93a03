use crate::snapshot::{level_db, HarmonicSnapshot};

/// Builds the summary shown in the plot's text box.
///
/// Line 1 is the THD, line 2 the fundamental level in dBVrms. A third line
/// with the first harmonic relative to the fundamental (dBc) is added only
/// when at least one harmonic was reported; further harmonics never get a
/// line of their own.
pub fn format_annotation(snapshot: &HarmonicSnapshot) -> String {
    let spectrum = snapshot.spectrum();
    let bins = snapshot.harmonic_bins();
    let s0 = level_db(spectrum[bins[0]]);

    let mut lines = vec![
        format!("THD={:.2}%", snapshot.thd_percent()),
        format!("s0={} dBVrms", round_db(s0)),
    ];
    if let Some(&second) = bins.get(1) {
        let s1 = level_db(spectrum[second]);
        lines.push(format!("s1={} dBc", round_db(s1 - s0)));
    }
    lines.join("\n")
}

fn round_db(db: f64) -> i64 {
    // Saturating cast: -inf (silent bin) prints as i64::MIN rather than panicking.
    db.round() as i64
}
