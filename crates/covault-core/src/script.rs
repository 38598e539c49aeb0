//! Script parameterization.
//!
//! Turns a catalogue template plus the parameter bag into a concrete
//! redeem script, scriptPubKey, and address for one planned output:
//! placeholders become hex-encoded keys or key hashes, `<TIMELOCK1>`
//! becomes the minimally-encoded CScriptNum of `base × multiplier`, the
//! token stream is assembled through the canonical opcode table, and the
//! result is wrapped as P2WSH (or P2WPKH for the user's funding coin).

use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::opcodes::all as opcodes;
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Address, ScriptBuf};

use crate::error::VaultError;
use crate::params::{PlaceholderValue, VaultParameters};
use crate::templates::TemplateKind;

// ==============================================================================
// CScriptNum
// ==============================================================================

/// Encode an integer in Bitcoin's minimal CScriptNum format:
/// little-endian, sign carried in the high bit of the last byte, zero as
/// the empty vector.
pub fn scriptnum_encode(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut bytes = Vec::new();
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = bytes.last_mut().expect("non-zero value has bytes");
        *last |= 0x80;
    }
    bytes
}

/// Decode a CScriptNum back to an integer. Inverse of [`scriptnum_encode`]
/// for any minimally-encoded input.
pub fn scriptnum_decode(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        let byte = if i == bytes.len() - 1 {
            byte & 0x7f
        } else {
            *byte
        };
        value |= i64::from(byte) << (8 * i);
    }
    if bytes.last().expect("checked non-empty") & 0x80 != 0 {
        -value
    } else {
        value
    }
}

// ==============================================================================
// Opcode Table
// ==============================================================================

/// Canonical opcode-name table covering every opcode the catalogue's
/// templates and the CTV engine emit.
fn opcode_by_name(token: &str) -> Option<Opcode> {
    let opcode = match token {
        "OP_0" | "OP_FALSE" => opcodes::OP_PUSHBYTES_0,
        "OP_1" | "OP_TRUE" => opcodes::OP_PUSHNUM_1,
        "OP_CHECKSIG" => opcodes::OP_CHECKSIG,
        "OP_CHECKSIGVERIFY" => opcodes::OP_CHECKSIGVERIFY,
        "OP_CHECKSEQUENCEVERIFY" | "OP_CSV" => opcodes::OP_CSV,
        "OP_IF" => opcodes::OP_IF,
        "OP_NOTIF" => opcodes::OP_NOTIF,
        "OP_ELSE" => opcodes::OP_ELSE,
        "OP_ENDIF" => opcodes::OP_ENDIF,
        "OP_DROP" => opcodes::OP_DROP,
        "OP_2DROP" => opcodes::OP_2DROP,
        "OP_ROLL" => opcodes::OP_ROLL,
        // BIP-119 assigns OP_CHECKTEMPLATEVERIFY to the NOP4 slot.
        "OP_NOP4" | "OP_CHECKTEMPLATEVERIFY" => opcodes::OP_NOP4,
        _ => return None,
    };
    Some(opcode)
}

// ==============================================================================
// Template Expansion
// ==============================================================================

/// Substitute keys, key hashes, and timelocks into a template's script
/// text and normalize whitespace. Any residual `<...>` token is an error.
pub fn expand_template(
    kind: TemplateKind,
    params: &VaultParameters,
    timelock_multiplier: u32,
) -> Result<String, VaultError> {
    let template = kind.template();
    let mut script = template.script_template.to_string();

    for (name, _) in template.placeholders {
        let value = params
            .placeholder_value(name)
            .ok_or_else(|| VaultError::MissingParameter((*name).to_string()))?;
        let hex = match value {
            PlaceholderValue::Key(pk) => pk.to_bytes().to_lower_hex_string(),
            PlaceholderValue::Hash(hash) => hash.to_string(),
        };
        script = script.replace(&format!("<{name}>"), &hex);
    }

    if let Some(timelocks) = &template.relative_timelocks {
        for (name, base) in timelocks.replacements {
            let value = base * u64::from(timelock_multiplier);
            let bytes = scriptnum_encode(value as i64);
            // CScriptNum zero is the empty vector; as a token that is an
            // explicit empty push, not a vanished operand.
            let token = if bytes.is_empty() {
                "OP_0".to_string()
            } else {
                bytes.to_lower_hex_string()
            };
            script = script.replace(&format!("<{name}>"), &token);
        }
    }

    if script.contains('<') {
        return Err(VaultError::UnresolvedPlaceholder(
            script.split_whitespace().collect::<Vec<_>>().join(" "),
        ));
    }

    Ok(script.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Assemble a normalized token stream into a script: opcode names through
/// the canonical table, everything else as a hex byte-string push.
pub fn assemble(script_text: &str) -> Result<ScriptBuf, VaultError> {
    let mut builder = Builder::new();
    for token in script_text.split_whitespace() {
        if let Some(opcode) = opcode_by_name(token) {
            builder = builder.push_opcode(opcode);
            continue;
        }
        let bytes = Vec::<u8>::from_hex(token).map_err(|_| {
            VaultError::InvalidPlan(format!("unknown script token `{token}`"))
        })?;
        let push = PushBytesBuf::try_from(bytes)
            .map_err(|_| VaultError::InvalidPlan(format!("oversized push `{token}`")))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

// ==============================================================================
// Output Finalization
// ==============================================================================

/// The concrete scripts derived for one planned output.
#[derive(Debug, Clone)]
pub struct OutputScripts {
    pub script_pubkey: ScriptBuf,
    /// The P2WSH witness script; absent for the P2WPKH user coin.
    pub redeem_script: Option<ScriptBuf>,
    pub address: Address,
}

/// Parameterize one output's template into final scripts and an address
/// for the parameter bag's network.
pub fn finalize_output_scripts(
    kind: TemplateKind,
    params: &VaultParameters,
    timelock_multiplier: u32,
) -> Result<OutputScripts, VaultError> {
    if kind == TemplateKind::User {
        // The funding coin is a plain P2WPKH held by the user's wallet.
        let public_key = params.user_key.public_key;
        return Ok(OutputScripts {
            script_pubkey: ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash()),
            redeem_script: None,
            address: Address::p2wpkh(&public_key, params.network),
        });
    }

    let text = expand_template(kind, params, timelock_multiplier)?;
    tracing::debug!(template = ?kind, script = %text, "parameterized output script");
    let redeem_script = assemble(&text)?;
    let script_pubkey = ScriptBuf::new_p2wsh(&redeem_script.wscript_hash());
    let address = Address::p2wsh(&redeem_script, params.network);
    Ok(OutputScripts {
        script_pubkey,
        redeem_script: Some(redeem_script),
        address,
    })
}

#[cfg(test)]
mod tests {
    use bitcoin::opcodes::all as opcodes;
    use bitcoin::script::Instruction;

    use super::*;
    use crate::test_util::test_parameters;

    #[test]
    fn scriptnum_encoding_matches_known_vectors() {
        assert_eq!(scriptnum_encode(0), Vec::<u8>::new());
        assert_eq!(scriptnum_encode(144), vec![0x90, 0x00]);
        assert_eq!(scriptnum_encode(144 * 100), vec![0x40, 0x38]);
        assert_eq!(scriptnum_encode(1), vec![0x01]);
        assert_eq!(scriptnum_encode(-1), vec![0x81]);
    }

    #[test]
    fn scriptnum_round_trips() {
        for value in [0i64, 1, 127, 128, 144, 4032, 4176, 65535, -5, -300] {
            assert_eq!(
                scriptnum_decode(&scriptnum_encode(value)),
                value,
                "round trip failed for {value}"
            );
        }
    }

    #[test]
    fn expand_leaves_no_placeholders() {
        let params = test_parameters(5);
        for kind in TemplateKind::ALL {
            let text = expand_template(kind, &params, 1).expect("expansion succeeds");
            assert!(!text.contains('<'), "{kind:?} left placeholders: {text}");
            assert!(!text.contains('\n'));
        }
    }

    #[test]
    fn shard_script_embeds_the_scaled_timelock() {
        let params = test_parameters(5);
        let scripts = finalize_output_scripts(TemplateKind::Shard, &params, 28)
            .expect("shard finalizes");
        let redeem = scripts.redeem_script.expect("shard is P2WSH");

        // Find the CSV operand and decode it back.
        let mut previous_push: Option<Vec<u8>> = None;
        let mut csv_operand = None;
        for instruction in redeem.instructions() {
            match instruction.expect("script parses") {
                Instruction::PushBytes(bytes) => previous_push = Some(bytes.as_bytes().to_vec()),
                Instruction::Op(op) if op == opcodes::OP_CSV => {
                    csv_operand = previous_push.clone();
                }
                Instruction::Op(_) => {}
            }
        }
        let operand = csv_operand.expect("script contains OP_CSV");
        assert_eq!(scriptnum_decode(&operand), 144 * 28);
    }

    #[test]
    fn user_coin_is_p2wpkh() {
        let params = test_parameters(5);
        let scripts =
            finalize_output_scripts(TemplateKind::User, &params, 1).expect("user finalizes");
        assert!(scripts.script_pubkey.is_p2wpkh());
        assert!(scripts.redeem_script.is_none());
    }

    #[test]
    fn p2wsh_wrap_commits_to_the_redeem_script() {
        let params = test_parameters(5);
        let scripts = finalize_output_scripts(TemplateKind::BasicPresigned, &params, 1)
            .expect("template finalizes");
        let redeem = scripts.redeem_script.expect("P2WSH output");
        assert_eq!(
            scripts.script_pubkey,
            ScriptBuf::new_p2wsh(&redeem.wscript_hash())
        );
        assert!(scripts.script_pubkey.is_p2wsh());
    }

    #[test]
    fn assemble_rejects_unknown_tokens() {
        let err = assemble("OP_CHECKSIG definitely-not-hex").expect_err("bad token");
        assert!(matches!(err, VaultError::InvalidPlan(_)));
    }

    #[test]
    fn zero_timelock_becomes_an_explicit_empty_push() {
        let params = test_parameters(5);
        let text = expand_template(TemplateKind::Shard, &params, 0).expect("expansion succeeds");
        assert!(text.contains("OP_0 OP_CHECKSEQUENCEVERIFY"));
    }
}
