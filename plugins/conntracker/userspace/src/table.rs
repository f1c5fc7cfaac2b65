use aya::maps::{Array, MapData};
use conntracker_common::{BPF_ANY, BPF_EXIST, FilterRuleRecord};
use guarder_core::error::TableError;
use guarder_core::store::{PublishMode, RuleTable};

/// The kernel's `filter_map` array.
pub struct FilterTable {
    map: Array<MapData, FilterRuleRecord>,
}

impl FilterTable {
    pub fn new(map: Array<MapData, FilterRuleRecord>) -> Self {
        Self { map }
    }
}

impl RuleTable for FilterTable {
    fn publish(
        &mut self,
        slot: u32,
        record: &FilterRuleRecord,
        mode: PublishMode,
    ) -> Result<(), TableError> {
        self.map
            .set(slot, record, update_flags(mode))
            .map_err(|e| TableError {
                slot,
                detail: e.to_string(),
            })
    }
}

fn update_flags(mode: PublishMode) -> u64 {
    match mode {
        PublishMode::Insert => BPF_ANY,
        PublishMode::MustExist => BPF_EXIST,
    }
}
