use crate::error::{ApiError, ApiResult};
use crate::mailutils::{self, attachment_filename, attachment_url, MessageDraft};
use crate::server::AppState;
use crate::session::{gen_session_key, session_cookie, AuthenticatedAccount, RequestSession};
use crate::types::{
    Contact, Credentials, Mail, MailboxDetail, Mailbox, RecipientType, ResendRequest, SendMailRequest,
};
use crate::account::Account;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use axum::response::{AppendHeaders, IntoResponse, Json, Redirect, Response};
use axum::Extension;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

const ATTACHMENT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_CONTACTS_LIMIT: usize = 20;

/// Decode a JSON body whatever its content type, clients often post without one
fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

async fn owned_mail(state: &AppState, mail_id: &str, account: &Account, denied: &str) -> ApiResult<Mail> {
    let mail = state
        .store
        .get_mail(mail_id)
        .await
        .ok_or_else(|| ApiError::not_found("Mail not found"))?;
    if mail.account != account.name {
        warn!("[HTTP] '{}' denied access to mail {}", account.name, mail_id);
        return Err(ApiError::forbidden(denied));
    }
    Ok(mail)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<RequestSession>,
    body: Bytes,
) -> ApiResult<Response> {
    let credentials: Credentials = parse_json_body(&body)?;
    let account = state
        .accounts
        .authenticate(&credentials)
        .ok_or_else(|| ApiError::forbidden("Authentication failed. Check your credentials."))?;

    // Never reuse the key the client came with
    if let Some(old_key) = &current.key {
        state.store.delete_user_session(old_key).await;
    }

    let session_key = gen_session_key();
    let mut session = state.store.get_user_session(&session_key).await;
    session.account = Some(account.name.clone());
    state.store.save_user_session(&session_key, session).await;

    info!("[HTTP] '{}' logged in", account.name);
    Ok((
        AppendHeaders([(SET_COOKIE, session_cookie(&session_key))]),
        Json(account),
    )
        .into_response())
}

pub async fn logout(State(state): State<Arc<AppState>>, auth: AuthenticatedAccount) -> Response {
    state.store.delete_user_session(&auth.session_key).await;
    info!("[HTTP] '{}' logged out", auth.account.name);
    (
        AppendHeaders([(SET_COOKIE, session_cookie(&gen_session_key()))]),
        Json("Ok"),
    )
        .into_response()
}

pub async fn account(auth: AuthenticatedAccount) -> Json<Account> {
    Json(auth.account)
}

pub async fn index() -> Redirect {
    Redirect::to("/index.html")
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn mailboxes(State(state): State<Arc<AppState>>, auth: AuthenticatedAccount) -> Json<Vec<Mailbox>> {
    Json(state.store.get_mailboxes(&auth.account.name).await)
}

pub async fn mailbox(
    State(state): State<Arc<AppState>>,
    Path(mailbox_id): Path<String>,
    auth: AuthenticatedAccount,
) -> ApiResult<Json<MailboxDetail>> {
    let mailbox = state
        .store
        .get_mailbox(&mailbox_id)
        .await
        .ok_or_else(|| ApiError::not_found("Mailbox not found"))?;
    if mailbox.mailbox.account != auth.account.name {
        warn!("[HTTP] '{}' denied access to mailbox {}", auth.account.name, mailbox_id);
        return Err(ApiError::forbidden("You don't have permission to see this mailbox."));
    }
    Ok(Json(mailbox))
}

pub async fn mail(
    State(state): State<Arc<AppState>>,
    Path(mail_id): Path<String>,
    auth: AuthenticatedAccount,
) -> ApiResult<Json<Mail>> {
    let mut mail = owned_mail(&state, &mail_id, &auth.account, "You don't have permission to see this mail.").await?;

    for att in mail.attachments.iter_mut() {
        let filename = att
            .filename
            .clone()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| attachment_filename(att.index, &att.content_type));
        att.url = Some(attachment_url(&mail.id, att.index, &filename));
        att.filename = Some(filename);
    }

    Ok(Json(mail))
}

pub async fn mail_mark_read(
    State(state): State<Arc<AppState>>,
    Path(mail_id): Path<String>,
    auth: AuthenticatedAccount,
) -> ApiResult<Json<Mail>> {
    owned_mail(&state, &mail_id, &auth.account, "You don't have permission to see this mail.").await?;

    let mail = state
        .store
        .mark_read(&mail_id)
        .await
        .ok_or_else(|| ApiError::not_found("Mail not found"))?;
    Ok(Json(mail))
}

pub async fn mail_download_attachment(
    State(state): State<Arc<AppState>>,
    Path((mail_id, att_index, _filename)): Path<(String, usize, String)>,
    auth: AuthenticatedAccount,
) -> ApiResult<Response> {
    owned_mail(&state, &mail_id, &auth.account, "You don't have permission to see this mail.").await?;

    let (attachment, content) = state
        .store
        .get_mail_attachment(&mail_id, att_index)
        .await
        .ok_or_else(|| ApiError::not_found("Attachment not found"))?;
    debug!(
        "[HTTP] Streaming attachment {} of mail {} ({} bytes)",
        att_index,
        mail_id,
        content.len()
    );

    let length = content.len();
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..length)
        .step_by(ATTACHMENT_CHUNK_SIZE)
        .map(|start| Ok(content.slice(start..(start + ATTACHMENT_CHUNK_SIZE).min(length))))
        .collect();

    Response::builder()
        .header(CONTENT_TYPE, attachment.content_type.as_str())
        .header(CONTENT_LENGTH, length)
        .body(Body::from_stream(futures_util::stream::iter(chunks)))
        .map_err(|e| ApiError::Internal(e.into()))
}

pub async fn sendmail(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedAccount,
    body: Bytes,
) -> ApiResult<Json<Mail>> {
    let request: SendMailRequest = parse_json_body(&body)?;
    if request.recipients.is_empty() {
        return Err(ApiError::bad_request("No recipient"));
    }

    let from = mailutils::parse_email(&auth.account.address)?;
    let mut draft = MessageDraft {
        subject: request.subject,
        content: request.content,
        from: from.clone(),
        attachments: request.attachments,
        ..Default::default()
    };

    let mut all_addrs = Vec::with_capacity(request.recipients.len());
    for recipient in &request.recipients {
        let addr = mailutils::parse_email(&recipient.address).map_err(ApiError::bad_request)?;
        match recipient.kind {
            RecipientType::To => draft.tos.push(addr.clone()),
            RecipientType::Cc => draft.ccs.push(addr.clone()),
            RecipientType::Bcc => draft.bccs.push(addr.clone()),
        }
        all_addrs.push(addr);
    }

    let message = mailutils::make_msg(&draft).map_err(ApiError::bad_request)?;
    let mail = state
        .sender
        .send_mail(&auth.account, message, &from, &all_addrs)
        .await?;

    info!(
        "[HTTP] '{}' sent mail {} to {} recipient(s)",
        auth.account.name,
        mail.id,
        all_addrs.len()
    );
    Ok(Json(mail))
}

pub async fn mail_resend(
    State(state): State<Arc<AppState>>,
    Path(mail_id): Path<String>,
    auth: AuthenticatedAccount,
    body: Bytes,
) -> ApiResult<Json<Mail>> {
    let mail = owned_mail(&state, &mail_id, &auth.account, "You don't have permission to resend this mail.").await?;

    let request: ResendRequest = parse_json_body(&body)?;
    let to = mailutils::parse_email(&request.to).map_err(ApiError::bad_request)?;

    let mail = state.sender.resend_mail(&auth.account, &mail, &[to]).await?;
    Ok(Json(mail))
}

#[derive(Debug, Deserialize)]
pub struct ContactsQuery {
    #[serde(default)]
    pub text: String,
    pub limit: Option<usize>,
}

pub async fn contacts_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactsQuery>,
    auth: AuthenticatedAccount,
) -> Json<Vec<Contact>> {
    if query.text.trim().is_empty() {
        return Json(vec![]);
    }

    let limit = query.limit.unwrap_or(DEFAULT_CONTACTS_LIMIT);
    Json(
        state
            .store
            .contacts_search(&auth.account.name, &query.text, limit)
            .await,
    )
}
