use strum_macros::{Display, EnumString};

/// How a code line is picked from the symbolic and plain listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum LineChoicePolicy {
    /// Symbolic text for calls and branches only, plain text everywhere else.
    #[default]
    BranchTargets,
    PreferVerbose,
    PreferPlain,
}

/// Switches for one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcOptions {
    pub local_offsets: bool,
    pub entab_output: bool,
    pub data_sections: bool,
    pub checksum: bool,
    pub verbose_msg_sends: bool,
    pub separate_logical_blocks: bool,
    pub demangle_cpp_names: bool,
    pub return_types: bool,
    pub variable_types: bool,
    pub line_choice: LineChoicePolicy,
}

impl Default for ProcOptions {
    fn default() -> Self {
        ProcOptions {
            local_offsets: true,
            entab_output: false,
            data_sections: false,
            checksum: true,
            verbose_msg_sends: true,
            separate_logical_blocks: false,
            demangle_cpp_names: true,
            return_types: true,
            variable_types: true,
            line_choice: LineChoicePolicy::default(),
        }
    }
}
