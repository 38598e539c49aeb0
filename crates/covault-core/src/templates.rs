//! The script-template catalogue.
//!
//! Templates are pure data: a textual output script with named placeholders
//! in angle brackets, a witness-template map tying signature placeholders to
//! the keys that produce them, and per-selector witness stack templates.
//! The parameterizer (`crate::script`) substitutes concrete keys and
//! timelocks; nothing in this module touches key material.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// ==============================================================================
// Witness Selectors
// ==============================================================================

/// Names one spending path of an output's script. A planned input stores the
/// selector it intends to use; the pre-sign engine expands the matching
/// witness template at signing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WitnessSelector {
    Presigned,
    ColdWallet,
    HotWallet,
    User,
}

impl WitnessSelector {
    pub fn label(self) -> &'static str {
        match self {
            Self::Presigned => "presigned",
            Self::ColdWallet => "cold-wallet",
            Self::HotWallet => "hot-wallet",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for WitnessSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ==============================================================================
// Template Catalogue
// ==============================================================================

/// Identifies one entry of the template catalogue. Every planned output
/// carries a `TemplateKind`; the static template data is looked up on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// P2WPKH coin controlled by the user's wallet. This is the funding coin
    /// that gets sent into the vault; the vault never signs for it beyond
    /// the funding-commit transaction.
    User,
    /// Spendable by the cold wallet keys after a relative timelock, OR
    /// immediately burnable via the ephemeral 2-of-2.
    ColdStorage,
    /// Provably unspendable.
    BurnUnspendable,
    /// Spendable only by the ephemeral 2-of-2 after a relative timelock;
    /// the single pre-signed child is the only way forward.
    BasicPresigned,
    /// Sharded coin: push to cold storage via the ephemeral 2-of-2, OR
    /// spendable by the hot wallet after a timeout that scales with the
    /// shard index.
    Shard,
    /// Zero-value anyone-can-spend output for child-pays-for-parent fee
    /// bumping.
    CpfpHook,
}

/// Relative-timelock metadata for a template: named timelock values and
/// which witness selector activates which of them.
#[derive(Debug, Clone, Copy)]
pub struct RelativeTimelocks {
    pub replacements: &'static [(&'static str, u64)],
    pub selections: &'static [(WitnessSelector, &'static str)],
}

impl RelativeTimelocks {
    /// Base timelock value activated by `selector`, before any
    /// per-output multiplier is applied.
    pub fn base_for(&self, selector: WitnessSelector) -> Option<u64> {
        let name = self
            .selections
            .iter()
            .find(|(s, _)| *s == selector)
            .map(|(_, name)| *name)?;
        self.replacements
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

/// One catalogue entry. `placeholders` documents the parameters the script
/// text consumes; `witness_template_map` ties each signature placeholder to
/// the key placeholder that signs it.
#[derive(Debug, Clone, Copy)]
pub struct ScriptTemplate {
    pub placeholders: &'static [(&'static str, &'static str)],
    pub script_template: &'static str,
    pub witness_template_map: &'static [(&'static str, &'static str)],
    pub witness_templates: &'static [(WitnessSelector, &'static str)],
    pub relative_timelocks: Option<RelativeTimelocks>,
}

impl ScriptTemplate {
    pub fn witness_template(&self, selector: WitnessSelector) -> Option<&'static str> {
        self.witness_templates
            .iter()
            .find(|(s, _)| *s == selector)
            .map(|(_, t)| *t)
    }

    pub fn signing_key_for(&self, sig_placeholder: &str) -> Option<&'static str> {
        self.witness_template_map
            .iter()
            .find(|(sig, _)| *sig == sig_placeholder)
            .map(|(_, key)| *key)
    }
}

static USER: ScriptTemplate = ScriptTemplate {
    placeholders: &[("user_key_hash160", "hash160 of the user public key")],
    // Bitcoin Core wallets hand out P2WPKH coins by default, so the funding
    // coin is modeled as one.
    script_template: "<user_key_hash160>",
    witness_template_map: &[("user_key_sig", "user_key")],
    witness_templates: &[(WitnessSelector::User, "<user_key_sig> <user_key>")],
    relative_timelocks: None,
};

static COLD_STORAGE: ScriptTemplate = ScriptTemplate {
    placeholders: &[
        ("ephemeral_key_1", "first ephemeral multisig key"),
        ("ephemeral_key_2", "second ephemeral multisig key"),
        ("cold_key1", "first cold wallet key"),
        ("cold_key2", "second cold wallet key"),
    ],
    script_template: "
<ephemeral_key_1> OP_CHECKSIG OP_NOTIF
  <cold_key1> OP_CHECKSIGVERIFY <cold_key2> OP_CHECKSIGVERIFY
  <TIMELOCK1> OP_CHECKSEQUENCEVERIFY
OP_ELSE
  <ephemeral_key_2> OP_CHECKSIG
OP_ENDIF
",
    witness_template_map: &[
        ("ephemeral_sig_1", "ephemeral_key_1"),
        ("ephemeral_sig_2", "ephemeral_key_2"),
        ("cold_key1_sig", "cold_key1"),
        ("cold_key2_sig", "cold_key2"),
    ],
    // The cold-wallet witness can only be completed by accessing the cold
    // keys at spend time. The presigned witness is complete before secure
    // key deletion, which is what lets the push-to-cold transaction exist
    // without touching cold storage.
    witness_templates: &[
        (WitnessSelector::Presigned, "<ephemeral_sig_2> <ephemeral_sig_1>"),
        (WitnessSelector::ColdWallet, "<cold_key2_sig> <cold_key1_sig>"),
    ],
    relative_timelocks: Some(RelativeTimelocks {
        replacements: &[("TIMELOCK1", 144)],
        selections: &[(WitnessSelector::ColdWallet, "TIMELOCK1")],
    }),
};

static BURN_UNSPENDABLE: ScriptTemplate = ScriptTemplate {
    placeholders: &[("unspendable_key_1", "a key nobody can know the secret for")],
    script_template: "<unspendable_key_1> OP_CHECKSIG",
    witness_template_map: &[],
    // intentionally empty
    witness_templates: &[],
    relative_timelocks: None,
};

static BASIC_PRESIGNED: ScriptTemplate = ScriptTemplate {
    placeholders: &[
        ("ephemeral_key_1", "first ephemeral multisig key"),
        ("ephemeral_key_2", "second ephemeral multisig key"),
    ],
    script_template: "<ephemeral_key_1> OP_CHECKSIGVERIFY <ephemeral_key_2> OP_CHECKSIGVERIFY <TIMELOCK1> OP_CHECKSEQUENCEVERIFY",
    witness_template_map: &[
        ("ephemeral_sig_1", "ephemeral_key_1"),
        ("ephemeral_sig_2", "ephemeral_key_2"),
    ],
    witness_templates: &[(
        WitnessSelector::Presigned,
        "<ephemeral_sig_2> <ephemeral_sig_1>",
    )],
    relative_timelocks: Some(RelativeTimelocks {
        replacements: &[("TIMELOCK1", 144)],
        selections: &[(WitnessSelector::Presigned, "TIMELOCK1")],
    }),
};

static SHARD: ScriptTemplate = ScriptTemplate {
    placeholders: &[
        ("hot_wallet_key", "hot wallet key"),
        ("ephemeral_key_1", "first ephemeral multisig key"),
        ("ephemeral_key_2", "second ephemeral multisig key"),
    ],
    script_template: "
<hot_wallet_key> OP_CHECKSIG OP_NOTIF
  <ephemeral_key_1> OP_CHECKSIGVERIFY <ephemeral_key_2> OP_CHECKSIGVERIFY
OP_ELSE
  <TIMELOCK1> OP_CHECKSEQUENCEVERIFY
OP_ENDIF
",
    witness_template_map: &[
        ("ephemeral_sig_1", "ephemeral_key_1"),
        ("ephemeral_sig_2", "ephemeral_key_2"),
        ("hot_wallet_key_sig", "hot_wallet_key"),
    ],
    witness_templates: &[
        (WitnessSelector::Presigned, "<ephemeral_sig_2> <ephemeral_sig_1>"),
        (WitnessSelector::HotWallet, "<hot_wallet_key_sig>"),
    ],
    relative_timelocks: Some(RelativeTimelocks {
        replacements: &[("TIMELOCK1", 144)],
        selections: &[(WitnessSelector::HotWallet, "TIMELOCK1")],
    }),
};

static CPFP_HOOK: ScriptTemplate = ScriptTemplate {
    placeholders: &[],
    // Anyone-can-spend. The witness stack may be empty for an OP_1 output.
    script_template: "OP_1",
    witness_template_map: &[],
    witness_templates: &[],
    relative_timelocks: None,
};

impl TemplateKind {
    pub const ALL: [TemplateKind; 6] = [
        TemplateKind::User,
        TemplateKind::ColdStorage,
        TemplateKind::BurnUnspendable,
        TemplateKind::BasicPresigned,
        TemplateKind::Shard,
        TemplateKind::CpfpHook,
    ];

    pub fn template(self) -> &'static ScriptTemplate {
        match self {
            Self::User => &USER,
            Self::ColdStorage => &COLD_STORAGE,
            Self::BurnUnspendable => &BURN_UNSPENDABLE,
            Self::BasicPresigned => &BASIC_PRESIGNED,
            Self::Shard => &SHARD,
            Self::CpfpHook => &CPFP_HOOK,
        }
    }
}

/// The union of placeholder names across the whole catalogue. Used to
/// sanity-check the parameter bag before a vault is built.
pub fn required_parameters() -> BTreeSet<&'static str> {
    TemplateKind::ALL
        .iter()
        .flat_map(|kind| kind.template().placeholders.iter().map(|(name, _)| *name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_parameters_is_union_of_all_placeholders() {
        let required = required_parameters();
        for name in [
            "user_key_hash160",
            "ephemeral_key_1",
            "ephemeral_key_2",
            "cold_key1",
            "cold_key2",
            "unspendable_key_1",
            "hot_wallet_key",
        ] {
            assert!(required.contains(name), "missing {name}");
        }
        assert_eq!(required.len(), 7);
    }

    #[test]
    fn shard_hot_wallet_path_carries_the_timelock() {
        let timelocks = TemplateKind::Shard
            .template()
            .relative_timelocks
            .expect("shard template has timelocks");
        assert_eq!(timelocks.base_for(WitnessSelector::HotWallet), Some(144));
        assert_eq!(timelocks.base_for(WitnessSelector::Presigned), None);
    }

    #[test]
    fn cold_storage_presigned_path_skips_the_timelock() {
        let timelocks = TemplateKind::ColdStorage
            .template()
            .relative_timelocks
            .expect("cold storage template has timelocks");
        assert_eq!(timelocks.base_for(WitnessSelector::ColdWallet), Some(144));
        assert_eq!(timelocks.base_for(WitnessSelector::Presigned), None);
    }

    #[test]
    fn burn_and_hook_have_intentionally_empty_witness_tables() {
        assert!(TemplateKind::BurnUnspendable
            .template()
            .witness_templates
            .is_empty());
        assert!(TemplateKind::CpfpHook.template().witness_templates.is_empty());
    }
}
