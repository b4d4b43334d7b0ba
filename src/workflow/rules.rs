//! Plugin Ordering Rules
//!
//! A static table describing, for each plugin type:
//! - which plugin types may precede it
//! - whether it may run after a failed predecessor
//! - whether its own failure blocks the rest of the pipeline
//! - what happens once it finishes

use super::model::PluginType;

/// Side effect applied after a plugin finishes successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessAction {
    None,
    /// Reset depublication marks and record publication totals
    Publish,
    /// Depublish the records or the whole dataset
    Depublish,
}

/// Ordering and failure semantics of one plugin type.
#[derive(Debug, Clone, Copy)]
pub struct PluginRule {
    /// Types whose output this plugin can consume. Empty means the plugin
    /// needs no record input.
    pub predecessors: &'static [PluginType],
    /// May run even if an earlier plugin of the execution failed
    pub tolerant_of_failed_predecessor: bool,
    /// A failure of this plugin does not stop subsequent plugins
    pub non_blocking: bool,
    /// Types that must have finished (in the workflow or in history) for
    /// this plugin to be allowed at all
    pub requires_finished: &'static [PluginType],
    pub post_process: PostProcessAction,
}

const HARVEST: &[PluginType] = &[PluginType::OaipmhHarvest, PluginType::HttpHarvest];

const ANY_RECORD_PRODUCER: &[PluginType] = &[
    PluginType::OaipmhHarvest,
    PluginType::HttpHarvest,
    PluginType::ValidationExternal,
    PluginType::Transformation,
    PluginType::ValidationInternal,
    PluginType::Normalization,
    PluginType::Enrichment,
    PluginType::MediaProcess,
    PluginType::Preview,
    PluginType::Publish,
];

const INDEX_REQUIREMENTS: &[PluginType] =
    &[PluginType::ValidationExternal, PluginType::Transformation];

impl PluginRule {
    const fn chained(predecessors: &'static [PluginType]) -> Self {
        Self {
            predecessors,
            tolerant_of_failed_predecessor: false,
            non_blocking: false,
            requires_finished: &[],
            post_process: PostProcessAction::None,
        }
    }
}

impl PluginType {
    /// Returns the ordering rule for this plugin type.
    pub const fn rule(self) -> PluginRule {
        match self {
            PluginType::OaipmhHarvest | PluginType::HttpHarvest => PluginRule::chained(&[]),
            PluginType::ValidationExternal => PluginRule::chained(HARVEST),
            PluginType::Transformation => PluginRule::chained(&[PluginType::ValidationExternal]),
            PluginType::ValidationInternal => PluginRule::chained(&[PluginType::Transformation]),
            PluginType::Normalization => PluginRule::chained(&[PluginType::ValidationInternal]),
            PluginType::Enrichment => PluginRule::chained(&[PluginType::Normalization]),
            PluginType::MediaProcess => PluginRule::chained(&[PluginType::Enrichment]),
            PluginType::LinkChecking => PluginRule {
                non_blocking: true,
                ..PluginRule::chained(ANY_RECORD_PRODUCER)
            },
            PluginType::Preview => PluginRule {
                requires_finished: INDEX_REQUIREMENTS,
                ..PluginRule::chained(&[PluginType::MediaProcess])
            },
            PluginType::Publish => PluginRule {
                requires_finished: INDEX_REQUIREMENTS,
                post_process: PostProcessAction::Publish,
                ..PluginRule::chained(&[PluginType::Preview])
            },
            PluginType::Depublish => PluginRule {
                tolerant_of_failed_predecessor: true,
                post_process: PostProcessAction::Depublish,
                ..PluginRule::chained(&[])
            },
        }
    }

    pub fn is_harvest(self) -> bool {
        HARVEST.contains(&self)
    }

    /// True for plugins that read records produced by another plugin.
    pub fn needs_record_input(self) -> bool {
        !self.rule().predecessors.is_empty()
    }

    /// Whether `predecessor` output can feed this plugin.
    pub fn accepts_predecessor(self, predecessor: PluginType) -> bool {
        self.rule().predecessors.contains(&predecessor)
    }
}
