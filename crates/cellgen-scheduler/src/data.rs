//! Cell records and the staged work that decodes them.
//!
//! A record is one stage byte followed by the opaque payload produced by the
//! stage executors.

use bytes::{BufMut, Bytes, BytesMut};
use cellgen_spatial::CellPos;
use cellgen_task::{Handoff, OnMainInput, Phases, StagedWork, TaskError, TaskResult};
use serde::Serialize;
use tracing::warn;

use crate::{SchedulerError, Stage};

/// Materialized content of one cell.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize)]
pub struct CellData {
    pub stage: Stage,
    #[serde(skip)]
    pub payload: Bytes,
}

impl CellData {
    #[must_use]
    pub fn new(stage: Stage, payload: impl Into<Bytes>) -> Self {
        Self {
            stage,
            payload: payload.into(),
        }
    }

    /// Freshly created cell with nothing generated.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.stage as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// # Errors
    ///
    /// If the record is empty or its stage byte is unknown.
    pub fn decode(cell: CellPos, mut record: Bytes) -> Result<Self, SchedulerError> {
        if record.is_empty() {
            return Err(SchedulerError::MalformedRecord {
                cell,
                reason: "empty record".into(),
            });
        }
        let raw = record[0];
        let stage = Stage::from_u8(raw).ok_or_else(|| SchedulerError::MalformedRecord {
            cell,
            reason: format!("unknown stage byte {raw}"),
        })?;
        if !stage.is_generation() {
            return Err(SchedulerError::MalformedRecord {
                cell,
                reason: format!("stored stage {stage} is not a generation stage"),
            });
        }
        let payload = record.split_off(1);
        Ok(Self { stage, payload })
    }
}

fn decode_or_empty(cell: CellPos, raw: TaskResult<Option<Bytes>>) -> TaskResult<CellData> {
    match raw {
        Ok(Some(record)) => {
            CellData::decode(cell, record).map_err(|e| TaskError::Decode(e.to_string()))
        }
        Ok(None) => Ok(CellData::empty()),
        Err(error) => {
            warn!(%cell, %error, "cell record unreadable, starting from empty");
            Ok(CellData::empty())
        }
    }
}

/// Loads the main cell record.
#[derive(Debug, Clone, Copy)]
pub struct CellRecordWork {
    /// Decode on the worker pool instead of the main queue.
    pub async_decode: bool,
}

impl StagedWork for CellRecordWork {
    type Intermediate = CellData;
    type Output = CellData;

    fn phases(&self) -> Phases {
        if self.async_decode {
            Phases::OffMain
        } else {
            Phases::OnMain
        }
    }

    fn off_main(
        &self,
        cell: CellPos,
        raw: TaskResult<Option<Bytes>>,
    ) -> TaskResult<Handoff<CellData, CellData>> {
        decode_or_empty(cell, raw).map(Handoff::Done)
    }

    fn on_main(
        &self,
        cell: CellPos,
        input: TaskResult<OnMainInput<CellData>>,
    ) -> TaskResult<CellData> {
        match input {
            Ok(OnMainInput::Raw(raw)) => decode_or_empty(cell, Ok(raw)),
            Ok(OnMainInput::Processed(data)) => Ok(data),
            Err(error) => decode_or_empty(cell, Err(error)),
        }
    }
}

/// Outcome of an auxiliary load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuxRecord {
    /// Read cleanly; `None` when nothing was stored.
    Loaded(Option<Bytes>),
    /// The read failed. The cell proceeds without the dataset and the stored
    /// copy is left alone.
    Unreadable,
}

impl AuxRecord {
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            AuxRecord::Loaded(bytes) => bytes.as_ref(),
            AuxRecord::Unreadable => None,
        }
    }
}

/// Loads an auxiliary dataset (entities, points of interest).
///
/// A failed read never fails the load; it yields [`AuxRecord::Unreadable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxRecordWork;

impl StagedWork for AuxRecordWork {
    type Intermediate = ();
    type Output = AuxRecord;

    fn phases(&self) -> Phases {
        Phases::OffMain
    }

    fn off_main(
        &self,
        cell: CellPos,
        raw: TaskResult<Option<Bytes>>,
    ) -> TaskResult<Handoff<(), AuxRecord>> {
        Ok(Handoff::Done(match raw {
            Ok(bytes) => AuxRecord::Loaded(bytes),
            Err(error) => {
                warn!(%cell, %error, "auxiliary record unreadable, continuing without it");
                AuxRecord::Unreadable
            }
        }))
    }
}
