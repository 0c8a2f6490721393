/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Registration flow: full name, then department, then verified.
//!
//! ```text
//! not_started ──▶ waiting_for_name ──▶ waiting_for_dept ──▶ done
//!                        ▲                                   ▲
//!   follow ──────────────┘       <confirm prefix><dept> ─────┘ (from any state)
//! ```
//!
//! [`Registration`] decides what to say and what to write; it never talks
//! to LINE itself. The caller turns an [`Outcome`] into a reply.

use std::sync::Arc;

use dpisline_config::RegistrationConfig;
use tracing::{debug, info};

use crate::departments::{DepartmentMatcher, ReplyOption};
use crate::profile::{ProfileStore, ProfileUpdate, RegistrationState, StoreError};

pub const WELCOME_PROMPT: &str = "สวัสดีค่ะ! ยินดีต้อนรับสู่ผู้ช่วย DPIS6 \
    กรุณาพิมพ์ **ชื่อ-นามสกุลจริง** ของคุณเพื่อยืนยันตัวตนค่ะ";
pub const NOT_REGISTERED_PROMPT: &str = "ระบบไม่พบข้อมูลการลงทะเบียนของคุณ \
    กรุณาพิมพ์ชื่อ-นามสกุลจริงเพื่อเริ่มการยืนยันตัวตนค่ะ";
pub const ASK_DEPARTMENT_PROMPT: &str = "ขอบคุณค่ะ! ตอนนี้กรุณา **พิมพ์ชื่อกรม** บางส่วน \
    (เช่น สรรพากร) เพื่อให้เราค้นหาตัวเลือกที่ถูกต้องค่ะ";
pub const NAME_TOO_SHORT_PROMPT: &str = "กรุณาพิมพ์ชื่อเต็มที่ถูกต้องค่ะ";
pub const CHOOSE_DEPARTMENT_PROMPT: &str = "กรุณาคลิกเลือกกรม/ส่วนราชการที่ถูกต้องจากตัวเลือกด้านล่าง\
    เพื่อยืนยันค่ะ (หรือพิมพ์ใหม่เพื่อค้นหาเพิ่มเติม)";
pub const DEPARTMENT_NOT_FOUND_PROMPT: &str = "ไม่พบชื่อกรมที่ใกล้เคียง \
    กรุณาลองพิมพ์ชื่อที่สั้นลง หรือพิมพ์ชื่อเต็มอีกครั้งค่ะ";
pub const IN_PROGRESS_PROMPT: &str = "ระบบกำลังประมวลผลการลงทะเบียนของคุณ กรุณารอสักครู่";

fn verified_message(department: &str) -> String {
    format!("✅ ยืนยันตัวตนสำเร็จ! คุณจาก {department} ยินดีให้บริการด้านโปรแกรม DPIS6 ค่ะ")
}

/// Reply text with optional quick-reply buttons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub options: Vec<ReplyOption>,
}

impl Prompt {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: Vec::new(),
        }
    }
}

/// What the caller should do with an inbound text message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Answer with this prompt.
    Reply(Prompt),
    /// The user is verified; forward the text to the AI relay.
    Relay { department: Option<String> },
    /// Say nothing.
    Ignore,
}

pub struct Registration {
    store: Arc<dyn ProfileStore>,
    matcher: DepartmentMatcher,
    confirm_prefix: String,
    min_name_chars: usize,
    max_options: usize,
}

impl Registration {
    pub fn new(store: Arc<dyn ProfileStore>, cfg: &RegistrationConfig) -> Self {
        Self {
            store,
            matcher: DepartmentMatcher::from_config(cfg),
            confirm_prefix: cfg.confirm_prefix.clone(),
            min_name_chars: cfg.min_name_chars,
            max_options: cfg.max_options,
        }
    }

    pub fn matcher(&self) -> &DepartmentMatcher {
        &self.matcher
    }

    /// The user added the bot (or unblocked it): start over from the name.
    pub async fn on_follow(&self, user_id: &str) -> Result<Prompt, StoreError> {
        self.store
            .update_user_profile(user_id, &ProfileUpdate::start())
            .await?;
        info!(user_id, "registration started");
        Ok(Prompt::text(WELCOME_PROMPT))
    }

    /// Handle one text message. `direct` is true for one-to-one chats; group
    /// and room traffic from verified users is not answered.
    pub async fn on_text(
        &self,
        user_id: &str,
        text: &str,
        direct: bool,
    ) -> Result<Outcome, StoreError> {
        if let Some(rest) = text.strip_prefix(self.confirm_prefix.as_str()) {
            return self.confirm(user_id, rest.trim()).await;
        }

        let profile = self.store.get_user_profile(user_id).await?;

        if let Some(ref p) = profile {
            if p.is_verified {
                return Ok(if direct {
                    Outcome::Relay {
                        department: p.department.clone(),
                    }
                } else {
                    debug!(user_id, "verified user outside a direct chat, ignoring");
                    Outcome::Ignore
                });
            }
        }

        let state = profile.map(|p| p.state()).unwrap_or_default();
        debug!(user_id, ?state, "registration step");

        let prompt = match state {
            RegistrationState::NotStarted => {
                self.store
                    .update_user_profile(user_id, &ProfileUpdate::start())
                    .await?;
                info!(user_id, "registration started from message");
                Prompt::text(NOT_REGISTERED_PROMPT)
            }
            RegistrationState::WaitingForName => {
                let name = text.trim();
                if name.chars().count() >= self.min_name_chars {
                    self.store
                        .update_user_profile(user_id, &ProfileUpdate::named(name))
                        .await?;
                    info!(user_id, "name recorded");
                    Prompt::text(ASK_DEPARTMENT_PROMPT)
                } else {
                    Prompt::text(NAME_TOO_SHORT_PROMPT)
                }
            }
            RegistrationState::WaitingForDept => self.department_prompt(text),
            RegistrationState::Done => Prompt::text(IN_PROGRESS_PROMPT),
        };
        Ok(Outcome::Reply(prompt))
    }

    /// Confirmation tap. Never falls through to the other steps: a
    /// department outside the catalog gets a re-prompt and no write.
    async fn confirm(&self, user_id: &str, department: &str) -> Result<Outcome, StoreError> {
        if department.is_empty() || !self.matcher.contains(department) {
            info!(user_id, department, "confirmation for unknown department");
            return Ok(Outcome::Reply(Prompt::text(DEPARTMENT_NOT_FOUND_PROMPT)));
        }
        self.store
            .update_user_profile(user_id, &ProfileUpdate::verified(department))
            .await?;
        info!(user_id, department, "registration complete");
        Ok(Outcome::Reply(Prompt::text(verified_message(department))))
    }

    fn department_prompt(&self, query: &str) -> Prompt {
        let matches = self.matcher.search(query);
        if matches.is_empty() {
            return Prompt::text(DEPARTMENT_NOT_FOUND_PROMPT);
        }
        Prompt {
            text: CHOOSE_DEPARTMENT_PROMPT.to_string(),
            options: self
                .matcher
                .options(&matches, &self.confirm_prefix, self.max_options),
        }
    }
}
