//! Registration and attendance flows.
//!
//! Every flow stages the upload, runs it through the engine thread, gates on
//! exactly one face, then hands the embedding to the matcher and the store.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use rollcall_core::{require_single_face, Embedding, EuclideanMatcher, Matcher};
use serde::Serialize;

use crate::engine::EngineHandle;
use crate::error::ServiceError;
use crate::store::{
    AttendanceEntry, AttendanceRecord, DayRange, Identity, MarkOutcome, NewIdentity,
    RegisterOutcome, Role, Store,
};
use crate::upload::StagedUpload;

#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub match_threshold: f32,
    pub duplicate_threshold: f32,
    pub embedding_dim: usize,
}

/// A registration request that passed field validation.
#[derive(Debug)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub image: Vec<u8>,
}

impl Registration {
    pub fn validate(
        name: Option<&str>,
        email: Option<&str>,
        role: Option<&str>,
        image: Option<Vec<u8>>,
    ) -> Result<Self, ServiceError> {
        let name = name.map(str::trim).unwrap_or_default();
        if name.is_empty() {
            return Err(ServiceError::Validation("name is required".into()));
        }

        let email = email.map(|e| e.trim().to_lowercase()).unwrap_or_default();
        if email.is_empty() {
            return Err(ServiceError::Validation("email is required".into()));
        }
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
        if !well_formed || email.contains(char::is_whitespace) {
            return Err(ServiceError::Validation(format!("invalid email {email:?}")));
        }

        let role = match role.map(str::trim).filter(|r| !r.is_empty()) {
            Some(r) => r.parse::<Role>().map_err(ServiceError::Validation)?,
            None => Role::default(),
        };

        let image = image
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| ServiceError::Validation("image is required".into()))?;

        Ok(Self {
            name: name.to_string(),
            email,
            role,
            image,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MarkedAttendance {
    pub identity: Identity,
    pub record: AttendanceRecord,
    pub distance: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub version: &'static str,
    pub models_loaded: bool,
    pub identities: usize,
    pub embedding_dim: usize,
    pub match_threshold: f32,
}

#[derive(Clone)]
pub struct AttendanceService {
    engine: EngineHandle,
    store: Store,
    settings: MatchSettings,
    upload_dir: PathBuf,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: Store,
        settings: MatchSettings,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            upload_dir,
        }
    }

    /// Stage the image, analyze it and return the single face's embedding.
    async fn probe(&self, image: Vec<u8>) -> Result<Embedding, ServiceError> {
        let upload = StagedUpload::write(&self.upload_dir, image).await?;
        let scan = self.engine.analyze(upload.path()).await;
        drop(upload);

        let face = require_single_face(scan?)?;
        // Same rules the store applies when reading the gallery back.
        face.embedding.validate(self.settings.embedding_dim)?;
        tracing::debug!(confidence = face.bbox.confidence, "probe: face accepted");
        Ok(face.embedding)
    }

    pub async fn register(&self, registration: Registration) -> Result<Identity, ServiceError> {
        let Registration {
            name,
            email,
            role,
            image,
        } = registration;
        let embedding = self.probe(image).await?;

        let new = NewIdentity {
            name,
            email,
            role,
            embedding,
        };
        match self.store.register(new, self.settings.duplicate_threshold).await? {
            RegisterOutcome::Created(identity) => {
                tracing::info!(id = %identity.id, role = identity.role.as_str(), "identity registered");
                Ok(identity)
            }
            RegisterOutcome::EmailTaken => Err(ServiceError::EmailAlreadyExists),
            RegisterOutcome::FaceTaken {
                identity_id,
                distance,
            } => {
                tracing::info!(existing = %identity_id, distance, "registration rejected: face already registered");
                Err(ServiceError::FaceAlreadyRegistered)
            }
        }
    }

    pub async fn mark_attendance(&self, image: Vec<u8>) -> Result<MarkedAttendance, ServiceError> {
        self.mark_attendance_at(image, Local::now()).await
    }

    /// Match the face in `image` and record attendance for the local day of `now`.
    pub async fn mark_attendance_at(
        &self,
        image: Vec<u8>,
        now: DateTime<Local>,
    ) -> Result<MarkedAttendance, ServiceError> {
        let probe = self.probe(image).await?;
        let gallery = self.store.gallery().await?;
        let result = EuclideanMatcher.compare(&probe, &gallery, self.settings.match_threshold)?;

        let Some(identity_id) = result.identity_id else {
            tracing::info!(
                distance = result.distance,
                gallery = gallery.len(),
                "mark: no match"
            );
            return Err(ServiceError::NoMatchFound);
        };
        if result.ambiguous {
            tracing::warn!(id = %identity_id, distance = result.distance, "mark: more than one identity under threshold");
        }

        // The identity may have been deleted since the gallery was read.
        let identity = self
            .store
            .identity(&identity_id)
            .await?
            .ok_or(ServiceError::NoMatchFound)?;

        match self.store.mark_attendance(&identity.id, now).await? {
            MarkOutcome::Created(record) => {
                tracing::info!(id = %identity.id, distance = result.distance, day = %record.day, "attendance marked");
                Ok(MarkedAttendance {
                    identity,
                    record,
                    distance: result.distance,
                })
            }
            MarkOutcome::AlreadyMarked => Err(ServiceError::AlreadyMarkedToday),
        }
    }

    pub async fn identities(&self) -> Result<Vec<Identity>, ServiceError> {
        Ok(self.store.identities().await?)
    }

    pub async fn attendance(&self, range: DayRange) -> Result<Vec<AttendanceEntry>, ServiceError> {
        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Err(ServiceError::Validation(
                    "startDate must not be after endDate".into(),
                ));
            }
        }
        Ok(self.store.attendance(range).await?)
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            models_loaded: self.engine.models_loaded().await?,
            identities: self.store.count_identities().await?,
            embedding_dim: self.settings.embedding_dim,
            match_threshold: self.settings.match_threshold,
        })
    }
}
