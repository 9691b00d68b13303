//! DKIM (RFC 6376 / RFC 8463) signature verification for received mail.

use crate::aggregate::{MessageVerdict, VerdictStore};
use crate::arh::{AuthenticationResults, IntegrationMode};
use crate::dns::Resolver;
use crate::keystore::{KeyRow, KeyStore, KeyStoreMode};
use crate::result::PresentationSignature;
use crate::signrules::{AutoAddScope, Rule, RuleSource, RuleStore};
use crate::verify::{TreatAs, VerifyPolicy};
use serde::Deserialize;
use std::sync::{Arc, Mutex as StdMutex};

#[macro_use]
extern crate quick_error;

pub mod aggregate;
pub mod arh;
pub mod canonicalization;
pub mod crypto;
pub mod dns;
mod errors;
mod hash;
pub mod key;
pub mod keystore;
mod message;
mod parser;
pub mod result;
mod signature;
pub mod signrules;
pub mod verify;

pub use errors::{DKIMError, Status, Warning};
pub use parser::Tag;

/// Every knob enumerated in spec §6, loaded by the host and handed to
/// [`CoreContext::new`]. Anything absent from the host's config document
/// falls back to the field's `Default` value.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub dkim_enable: bool,
    pub key_storing: KeyStoreMode,
    pub dns_timeout_connect_secs: u64,
    pub dns_use_dnssec: bool,
    pub policy_sign_rules_enable: bool,
    pub policy_sign_rules_check_default_rules: bool,
    pub policy_sign_rules_auto_add_rule: bool,
    pub policy_sign_rules_auto_add_rule_for: AutoAddScope,
    pub policy_sign_rules_sdid_allow_subdomains: bool,
    pub policy_dmarc_should_be_signed_enable: bool,
    pub arh_read: bool,
    pub arh_allowed_authserv: Vec<String>,
    pub arh_replace_addon_result: bool,
    pub arh_show_dkim_results: bool,
    pub error_algorithm_sign_rsa_sha1_treat_as: TreatAs,
    pub error_algorithm_rsa_weak_key_length_treat_as: TreatAs,
    pub error_key_testmode_ignore: bool,
    pub save_result: bool,
    pub display_key_secure: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dkim_enable: true,
            key_storing: KeyStoreMode::Cache,
            dns_timeout_connect_secs: 5,
            dns_use_dnssec: false,
            policy_sign_rules_enable: true,
            policy_sign_rules_check_default_rules: true,
            policy_sign_rules_auto_add_rule: false,
            policy_sign_rules_auto_add_rule_for: AutoAddScope::Address,
            policy_sign_rules_sdid_allow_subdomains: true,
            policy_dmarc_should_be_signed_enable: false,
            arh_read: false,
            arh_allowed_authserv: Vec::new(),
            arh_replace_addon_result: false,
            arh_show_dkim_results: true,
            error_algorithm_sign_rsa_sha1_treat_as: TreatAs::Warning,
            error_algorithm_rsa_weak_key_length_treat_as: TreatAs::Warning,
            error_key_testmode_ignore: false,
            save_result: true,
            display_key_secure: true,
        }
    }
}

impl CoreConfig {
    fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            rsa_sha1_treat_as: self.error_algorithm_sign_rsa_sha1_treat_as,
            weak_rsa_key_treat_as: self.error_algorithm_rsa_weak_key_length_treat_as,
            weak_rsa_key_floor_bits: 1024,
            weak_rsa_key_warn_bits: 2048,
            strict: false,
        }
    }
}

/// Everything an entry point needs to verify or manage one mail account's
/// DKIM state: the key store, the sign-rules store, the verdict cache, the
/// resolver and the config (spec §9 DESIGN NOTES: one context, no statics).
pub struct CoreContext {
    config: CoreConfig,
    keystore: KeyStore,
    resolver: Arc<dyn Resolver>,
    rules: StdMutex<RuleStore>,
    verdicts: VerdictStore,
}

impl CoreContext {
    pub fn new(
        config: CoreConfig,
        resolver: Arc<dyn Resolver>,
        key_db_path: &str,
        verdict_db_path: &str,
        default_rules: Vec<Rule>,
    ) -> Result<Self, DKIMError> {
        Ok(Self {
            keystore: KeyStore::open(key_db_path, config.key_storing)?,
            verdicts: VerdictStore::open(verdict_db_path)?,
            rules: StdMutex::new(RuleStore::new(default_rules)),
            resolver,
            config,
        })
    }

    /// Verifies one message and returns its persisted verdict (spec §6
    /// `verify`). `from_address`/`from_domain`/`list_id` are supplied by the
    /// host from whatever envelope/header metadata it already parsed;
    /// `is_sent_folder` disables sign-rule enforcement (spec §4.10).
    pub async fn verify(
        &self,
        message_id: &str,
        raw: &[u8],
        from_address: &str,
        from_domain: &str,
        list_id: Option<&str>,
        is_sent_folder: bool,
        now: i64,
    ) -> Result<MessageVerdict, DKIMError> {
        let policy = self.config.verify_policy();
        let (message, mut verified) =
            crate::verify::verify_message(raw, &self.keystore, self.resolver.as_ref(), &policy, now)
                .await?;
        crate::verify::sort_signatures(&mut verified, from_domain);

        let mut dkim: Vec<PresentationSignature> = verified
            .into_iter()
            .map(|v| PresentationSignature::new(v.result))
            .collect();

        if self.config.arh_read {
            let trusted = trusted_arh_headers(&message, &self.config.arh_allowed_authserv);
            let mode = if self.config.arh_replace_addon_result {
                IntegrationMode::Replace
            } else {
                IntegrationMode::Augment
            };
            dkim = crate::aggregate::integrate_arh(
                dkim,
                &trusted,
                mode,
                from_domain,
                self.config.error_algorithm_sign_rsa_sha1_treat_as,
            );
        }

        if self.config.policy_sign_rules_enable && !is_sent_folder {
            let verdict = self
                .rules
                .lock()
                .unwrap()
                .evaluate(from_domain, from_address, list_id);
            dkim = crate::aggregate::apply_sign_rules(dkim, &verdict);

            if self.config.policy_sign_rules_auto_add_rule {
                if let Some(sdid) = dkim.iter().find_map(|s| s.result.sdid()) {
                    let mut rules = self.rules.lock().unwrap();
                    if !rules.has_user_rule_for_sdid(sdid) {
                        rules.auto_add(
                            sdid,
                            self.config.policy_sign_rules_auto_add_rule_for,
                            from_address,
                        );
                    }
                }
            }
        }

        let bimi_indicator = extract_bimi_indicator(&message, &self.config.arh_allowed_authserv);
        let verdict = crate::aggregate::aggregate(dkim, bimi_indicator);

        if self.config.save_result {
            self.verdicts.save(message_id, &verdict)?;
        }
        Ok(verdict)
    }

    /// Clears a persisted verdict (spec §6 `resetResult`).
    pub fn reset_result(&self, message_id: &str) -> Result<(), DKIMError> {
        self.verdicts.reset(message_id)
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyRow>, DKIMError> {
        self.keystore.list_keys().await
    }

    pub async fn update_key(&self, sdid: &str, selector: &str, key: &str) -> Result<(), DKIMError> {
        self.keystore.update_key(sdid, selector, key).await
    }

    pub async fn delete_keys(&self, keys: &[(String, String)]) -> Result<(), DKIMError> {
        for (sdid, selector) in keys {
            self.keystore.delete_key(sdid, selector).await?;
        }
        Ok(())
    }

    pub async fn mark_key_as_secure(&self, sdid: &str, selector: &str) -> Result<(), DKIMError> {
        self.keystore.mark_key_secure(sdid, selector).await
    }

    pub fn list_rules(&self, source: RuleSource) -> Vec<Rule> {
        self.rules.lock().unwrap().list_rules(source).to_vec()
    }

    pub fn add_rule(&self, rule: Rule) -> u64 {
        self.rules.lock().unwrap().add_rule(rule)
    }

    pub fn update_rule(&self, id: u64, enabled: bool, priority: i32) {
        self.rules.lock().unwrap().update_rule(id, enabled, priority)
    }

    pub fn delete_rules(&self, ids: &[u64]) {
        self.rules.lock().unwrap().delete_rules(ids)
    }

    /// Replaces (or merges into) the user rule set with an imported payload
    /// (spec §6 `importRules`).
    pub fn import_rules(&self, rules: Vec<Rule>, replace: bool) {
        let mut store = self.rules.lock().unwrap();
        if replace {
            let existing_ids: Vec<u64> =
                store.list_rules(RuleSource::User).iter().map(|r| r.id).collect();
            store.delete_rules(&existing_ids);
        }
        for rule in rules {
            store.add_rule(rule);
        }
    }

    pub fn export_rules(&self) -> Vec<Rule> {
        self.rules.lock().unwrap().list_rules(RuleSource::User).to_vec()
    }

    /// Adds a one-off user exception rule for a sender/sdid pair (spec §6
    /// `policyAddUserException`, invoked from the per-tab UI).
    pub fn policy_add_user_exception(&self, from_address: &str, sdid: &str) -> u64 {
        self.rules
            .lock()
            .unwrap()
            .auto_add(sdid, AutoAddScope::Address, from_address)
    }
}

fn trusted_arh_headers(
    message: &message::Message,
    allowed: &[String],
) -> Vec<AuthenticationResults> {
    message
        .get_headers()
        .iter()
        .filter(|h| h.get_key_ref().eq_ignore_ascii_case("Authentication-Results"))
        .filter_map(|h| crate::arh::parse(&String::from_utf8_lossy(h.get_value_raw())).ok())
        .filter(|ar| crate::arh::is_trusted(&ar.authserv_id, allowed))
        .collect()
}

fn extract_bimi_indicator(message: &message::Message, allowed: &[String]) -> Option<Vec<u8>> {
    let trusted = trusted_arh_headers(message, allowed);
    let indicator_headers: Vec<&[u8]> = message
        .get_headers()
        .iter()
        .filter(|h| h.get_key_ref().eq_ignore_ascii_case("BIMI-Indicator"))
        .map(|h| h.get_value_raw())
        .collect();
    crate::arh::extract_bimi_indicator(&trusted, &indicator_headers)
}
