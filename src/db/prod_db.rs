use std::collections::HashMap;

use crate::db::{
    compile::CompilationArchive, constraints::ConstraintImport, lifetime_split::LifetimeSplit,
    profile::ChargingProfileArchive, reconcile::SubsetReplacement,
};

/// Production file layout.  Scripts and binaries get their paths from here
/// so a machine move is a one-file edit.
pub struct ProdDb {}

impl ProdDb {
    pub fn transport_on() -> CompilationArchive {
        CompilationArchive {
            spreadsheet: "/home/canoe/Archive/Transport/CANOE_TRN_ON_v4.xlsx".to_string(),
            template: "/home/canoe/Archive/Transport/canoe_trn_template.xlsx".to_string(),
            database: "/home/canoe/Archive/Sqlite/canoe_trn_on.sqlite".to_string(),
            schema: "/home/canoe/Archive/Sqlite/canoe_td_v2.sql".to_string(),
            precision: 10,
            region: "ON".to_string(),
            sector: "Transport".to_string(),
            epsilon: 1e-4,
            convert_emission_units: true,
            create_emission_embodied: false,
            wipe_database: true,
        }
    }

    pub fn ldv_charging_on() -> ChargingProfileArchive {
        ChargingProfileArchive {
            csv_path:
                "/home/canoe/Archive/ChargingProfiles/ON-2016TTS_no-we_2018_v4_2023-batteries.csv"
                    .to_string(),
            database: "/home/canoe/Archive/Sqlite/canoe_trn_on.sqlite".to_string(),
            time_zone: "America/Toronto".to_string(),
            weather_year: 2018,
            precision: 10,
        }
    }

    pub fn transport_subset_on() -> SubsetReplacement {
        SubsetReplacement::new(
            "/home/canoe/Archive/Sqlite/canoe_on_12d.sqlite",
            "/home/canoe/Archive/Sqlite/canoe_trn_on_v3.sqlite",
            Some("/home/canoe/Archive/Sqlite/canoe_trn_on_subset.sqlite"),
            "/home/canoe/Archive/Sqlite/replacement_log.txt",
        )
    }

    pub fn low_growth_constraints_on() -> ConstraintImport {
        ConstraintImport::new(
            "/home/canoe/Archive/Sqlite/canoe_on_12d_lowgrowth.sqlite",
            "/home/canoe/Archive/Constraints/trn_constraints_lowgrowth.xlsx",
        )
    }

    /// Seven lifetime percentile classes per drivetrain family.  Lifetimes
    /// are the expected value of the scrappage distribution up to each
    /// class percentile.
    pub fn lifetime_split_on() -> LifetimeSplit {
        let patterns = ["T_LDV_C_", "T_LDV_LT", "T_MDV_T", "T_HDV_T"];
        let classes: [(&str, [f64; 4]); 6] = [
            ("_S12", [4.0, 5.0, 6.0, 7.0]),
            ("_S24", [9.0, 10.0, 11.0, 12.0]),
            ("_S36", [11.0, 12.0, 13.0, 15.0]),
            ("_S64", [17.0, 19.0, 21.0, 24.0]),
            ("_S76", [20.0, 24.0, 25.0, 27.0]),
            ("_S88", [28.0, 32.0, 32.0, 32.0]),
        ];
        let mut lifetime_map = HashMap::new();
        for (suffix, lifetimes) in classes {
            let by_pattern: HashMap<String, f64> = patterns
                .iter()
                .zip(lifetimes)
                .map(|(p, l)| (p.to_string(), l))
                .collect();
            lifetime_map.insert(suffix.to_string(), by_pattern);
        }
        LifetimeSplit {
            database: "/home/canoe/Archive/Sqlite/canoe_on_12d_baseline_life_7.sqlite".to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            suffixes: classes.iter().map(|(s, _)| s.to_string()).collect(),
            lifetime_map,
            percentile_share: 0.12,
            parent_share: 0.28,
            periods: vec![2021, 2025, 2030, 2035, 2040, 2045, 2050],
            last_existing_period: 2020,
            region: "ON".to_string(),
        }
    }
}
