use std::collections::HashMap;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ServiceError;
use crate::service::{AttendanceService, MarkedAttendance, Registration, ServiceStatus};
use crate::store::{AttendanceEntry, DayRange, Identity};

/// Build the HTTP application. Routes are served at the root and again
/// under `/api`, the prefix the web and mobile clients use.
pub fn app(service: AttendanceService, max_upload_bytes: usize) -> Router {
    let api = Router::new()
        .route("/users", get(list_users))
        .route("/users/register", post(register))
        .route("/attendance", get(list_attendance))
        .route("/attendance/mark", post(mark_attendance))
        .route("/status", get(status));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Multipart form split into text fields and the `image` file.
#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    image: Option<Vec<u8>>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ServiceError> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "image" {
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                form.image = Some(bytes.to_vec());
            } else {
                let text = field.text().await.map_err(bad_multipart)?;
                form.fields.insert(name, text);
            }
        }
        Ok(form)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::Validation(format!("invalid multipart body: {err}"))
}

async fn register(
    State(service): State<AttendanceService>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Identity>), ServiceError> {
    let mut form = UploadForm::read(multipart).await?;
    let image = form.image.take();
    let registration = Registration::validate(
        form.field("name"),
        form.field("email"),
        form.field("role"),
        image,
    )?;
    let identity = service.register(registration).await?;
    Ok((StatusCode::CREATED, Json(identity)))
}

async fn list_users(
    State(service): State<AttendanceService>,
) -> Result<Json<Vec<Identity>>, ServiceError> {
    Ok(Json(service.identities().await?))
}

async fn mark_attendance(
    State(service): State<AttendanceService>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<MarkedAttendance>), ServiceError> {
    let form = UploadForm::read(multipart).await?;
    if form.field("faceDescriptor").or(form.field("descriptor")).is_some() {
        tracing::debug!("ignoring client-supplied descriptor, detecting server-side");
    }
    let image = form
        .image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ServiceError::Validation("image is required".into()))?;

    let marked = service.mark_attendance(image).await?;
    Ok((StatusCode::CREATED, Json(marked)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

fn parse_day(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>, ServiceError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ServiceError::Validation(format!("{name} must be YYYY-MM-DD, got {v:?}"))),
    }
}

async fn list_attendance(
    State(service): State<AttendanceService>,
    Query(query): Query<AttendanceQuery>,
) -> Result<Json<Vec<AttendanceEntry>>, ServiceError> {
    let range = DayRange {
        start: parse_day("startDate", query.start_date.as_deref())?,
        end: parse_day("endDate", query.end_date.as_deref())?,
    };
    Ok(Json(service.attendance(range).await?))
}

async fn status(
    State(service): State<AttendanceService>,
) -> Result<Json<ServiceStatus>, ServiceError> {
    Ok(Json(service.status().await?))
}
