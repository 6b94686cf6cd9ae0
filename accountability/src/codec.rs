//! Wire encoding of proofs.
//!
//! Wire format of a proof: a bincode-encoded [`RawProof`] envelope. The
//! message and each evidence are encoded as `[kind: u8][bincode body]`, where
//! kind is the [`MessageCode`] of a prevote, precommit or light proposal.
//! Full proposals never travel inside a proof.

use {
    crate::{
        error::CodecError,
        message::{ConsensusMessage, LightProposal, MessageCode, Vote},
        proof::{Proof, ProofType, Rule},
    },
    bincode::Options,
    serde::{Deserialize, Serialize},
};

/// Upper bound on an encoded proof.
pub const MAX_PROOF_SIZE: u64 = 4 * 1024 * 1024;

/// The on-wire proof envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProof {
    pub proof_type: u8,
    pub rule: u8,
    pub message: Vec<u8>,
    pub evidences: Vec<Vec<u8>>,
    pub offender_index: u64,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PROOF_SIZE)
}

/// Encode a single message as `[kind][body]`.
pub fn encode_message(msg: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    let body = match msg {
        ConsensusMessage::Proposal(_) => return Err(CodecError::FullProposal),
        ConsensusMessage::LightProposal(p) => options().serialize(p)?,
        ConsensusMessage::Prevote(v) | ConsensusMessage::Precommit(v) => options().serialize(v)?,
    };
    let mut out = Vec::with_capacity(body.len().saturating_add(1));
    out.push(msg.code() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a message produced by [`encode_message`].
pub fn decode_message(bytes: &[u8]) -> Result<ConsensusMessage, CodecError> {
    let (kind, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    match MessageCode::from_u8(*kind) {
        Some(MessageCode::Prevote) => Ok(ConsensusMessage::Prevote(
            options().deserialize::<Vote>(body)?,
        )),
        Some(MessageCode::Precommit) => Ok(ConsensusMessage::Precommit(
            options().deserialize::<Vote>(body)?,
        )),
        Some(MessageCode::LightProposal) => Ok(ConsensusMessage::LightProposal(
            options().deserialize::<LightProposal>(body)?,
        )),
        Some(MessageCode::Proposal) => Err(CodecError::FullProposal),
        None => Err(CodecError::UnknownKind(*kind)),
    }
}

/// Encode a proof. Full proposals must be converted with
/// [`ConsensusMessage::to_light`] first.
pub fn encode_proof(proof: &Proof) -> Result<Vec<u8>, CodecError> {
    let raw = RawProof {
        proof_type: proof.proof_type as u8,
        rule: proof.rule.id(),
        message: encode_message(&proof.message)?,
        evidences: proof
            .evidences
            .iter()
            .map(encode_message)
            .collect::<Result<_, _>>()?,
        offender_index: proof.offender_index as u64,
    };
    Ok(options().serialize(&raw)?)
}

/// Decode a proof, checking type and rule ids.
pub fn decode_proof(bytes: &[u8]) -> Result<Proof, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let raw: RawProof = options().deserialize(bytes)?;
    let proof_type =
        ProofType::from_u8(raw.proof_type).ok_or(CodecError::UnknownProofType(raw.proof_type))?;
    let rule = Rule::from_u8(raw.rule).ok_or(CodecError::UnknownRule(raw.rule))?;
    let offender_index = usize::try_from(raw.offender_index)
        .map_err(|_| CodecError::OffenderIndexOverflow(raw.offender_index))?;
    Ok(Proof {
        proof_type,
        rule,
        message: decode_message(&raw.message)?,
        evidences: raw
            .evidences
            .iter()
            .map(|e| decode_message(e))
            .collect::<Result<_, _>>()?,
        offender_index,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::test_utils::TestCommittee};

    #[test]
    fn test_proof_roundtrip_per_type() {
        let tc = TestCommittee::new(4);
        let v = tc.value(1);
        let light = tc.proposal(5, 2, 1, 0, b"b").to_light();
        let messages = [
            light.clone(),
            tc.prevote(5, 2, light.value(), 1),
            tc.aggregated_precommit(5, 2, v, &[1, 2, 3]),
        ];
        let evidence_sets = [
            vec![],
            vec![tc.precommit(5, 1, v, 2)],
            vec![
                light.clone(),
                tc.prevote(5, 1, tc.value(2), 0),
                tc.aggregated_prevote(5, 1, tc.value(2), &[1, 2]),
                tc.precommit(5, 1, v, 3),
            ],
        ];
        let kinds = [
            (ProofType::Misbehaviour, Rule::C),
            (ProofType::Accusation, Rule::PVO),
            (ProofType::Innocence, Rule::C1),
        ];
        for message in &messages {
            for evidences in &evidence_sets {
                for (proof_type, rule) in kinds {
                    let offender = message.signers().flatten_uniq()[0];
                    let proof =
                        Proof::new(proof_type, rule, message.clone(), evidences.clone(), offender);
                    let bytes = encode_proof(&proof).unwrap();
                    assert_eq!(decode_proof(&bytes).unwrap(), proof);
                }
            }
        }
    }

    #[test]
    fn test_full_proposal_cannot_be_encoded() {
        let tc = TestCommittee::new(4);
        let proposal = tc.proposal(5, 0, -1, 0, b"b");
        let proof = Proof::misbehaviour(Rule::InvalidProposer, proposal, vec![], 0);
        assert!(matches!(encode_proof(&proof), Err(CodecError::FullProposal)));
    }

    #[test]
    fn test_decode_rejects_unknown_ids() {
        let tc = TestCommittee::new(4);
        let proof = Proof::accusation(Rule::C1, tc.precommit(5, 0, tc.value(1), 1), vec![], 1);
        let mut raw: RawProof = options().deserialize(&encode_proof(&proof).unwrap()).unwrap();

        raw.rule = 42;
        let bytes = options().serialize(&raw).unwrap();
        assert!(matches!(decode_proof(&bytes), Err(CodecError::UnknownRule(42))));

        raw.rule = Rule::C1.id();
        raw.proof_type = 9;
        let bytes = options().serialize(&raw).unwrap();
        assert!(matches!(
            decode_proof(&bytes),
            Err(CodecError::UnknownProofType(9))
        ));

        raw.proof_type = ProofType::Accusation as u8;
        raw.message[0] = 7;
        let bytes = options().serialize(&raw).unwrap();
        assert!(matches!(decode_proof(&bytes), Err(CodecError::UnknownKind(7))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_proof(&[]), Err(CodecError::Empty)));
        assert!(decode_proof(&[1, 2, 3]).is_err());
        assert!(matches!(decode_message(&[]), Err(CodecError::Empty)));
    }
}
