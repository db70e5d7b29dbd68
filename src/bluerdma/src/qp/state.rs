//! Legal QP transitions and the attributes each one takes.
use bluerdma_api::net::{QpAttrMask as Mask, QpState, QpType};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) required: Mask,
    pub(crate) optional: Mask,
}

const fn t(required: Mask, optional: Mask) -> Option<Transition> {
    Some(Transition { required, optional })
}

pub(crate) fn transition(qp_type: QpType, cur: QpState, next: QpState) -> Option<Transition> {
    use QpState::*;
    use QpType::*;

    let empty = Mask::empty();
    match (cur, next) {
        (_, Reset) | (_, Error) => t(Mask::STATE, empty),
        (Reset, Init) => match qp_type {
            RC => t(
                Mask::STATE | Mask::PORT | Mask::ACCESS_FLAGS,
                Mask::PKEY_INDEX,
            ),
            UD => t(
                Mask::STATE | Mask::PKEY_INDEX | Mask::PORT | Mask::QKEY,
                empty,
            ),
        },
        (Init, Init) => match qp_type {
            RC => t(empty, Mask::PKEY_INDEX | Mask::PORT | Mask::ACCESS_FLAGS),
            UD => t(empty, Mask::PKEY_INDEX | Mask::PORT | Mask::QKEY),
        },
        (Init, Rtr) => match qp_type {
            RC => t(
                Mask::STATE
                    | Mask::AV
                    | Mask::PATH_MTU
                    | Mask::DEST_QPN
                    | Mask::RQ_PSN
                    | Mask::MAX_DEST_RD_ATOMIC,
                Mask::PKEY_INDEX | Mask::ACCESS_FLAGS | Mask::MIN_RNR_TIMER,
            ),
            UD => t(Mask::STATE, Mask::PKEY_INDEX | Mask::QKEY),
        },
        (Rtr, Rts) => match qp_type {
            RC => t(
                Mask::STATE
                    | Mask::SQ_PSN
                    | Mask::TIMEOUT
                    | Mask::RETRY_CNT
                    | Mask::RNR_RETRY
                    | Mask::MAX_QP_RD_ATOMIC,
                Mask::ACCESS_FLAGS | Mask::MIN_RNR_TIMER,
            ),
            UD => t(Mask::STATE | Mask::SQ_PSN, Mask::QKEY),
        },
        (Rts, Rts) => match qp_type {
            RC => t(empty, Mask::ACCESS_FLAGS | Mask::MIN_RNR_TIMER),
            UD => t(empty, Mask::QKEY),
        },
        (Sqe, Rts) => match qp_type {
            RC => t(Mask::STATE, Mask::ACCESS_FLAGS | Mask::MIN_RNR_TIMER),
            UD => t(Mask::STATE, Mask::QKEY),
        },
        _ => None,
    }
}

/// Validates `mask` for the `cur -> next` transition of a QP of `qp_type`.
pub(crate) fn check(qp_type: QpType, cur: QpState, next: QpState, mask: Mask) -> Result<()> {
    let t = transition(qp_type, cur, next).ok_or_else(|| {
        Error::InvalidState(format!(
            "{:?} QP cannot move from {:?} to {:?}",
            qp_type, cur, next
        ))
    })?;
    let missing = t.required - mask;
    if !missing.is_empty() {
        return Err(Error::InvalidAttribute(format!(
            "{:?} -> {:?} requires {:?}",
            cur, next, missing
        )));
    }
    let unexpected = mask - (t.required | t.optional | Mask::STATE | Mask::CUR_STATE);
    if !unexpected.is_empty() {
        return Err(Error::InvalidAttribute(format!(
            "{:?} -> {:?} does not take {:?}",
            cur, next, unexpected
        )));
    }
    Ok(())
}
