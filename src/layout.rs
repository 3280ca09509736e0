//! The CouchDB documents this crate manages and what goes into them.

use crate::config::CouchConfig;
use crate::reconcile::{DocumentTarget, Entry};
use couchkeeper_types::SecretBundle;

pub const LOCAL_DOCUMENT: &str = "local";
pub const DEFAULT_DOCUMENT: &str = "default";

pub const ADMINS_SECTION: &str = "admins";
pub const AUTH_SECTION: &str = "couch_httpd_auth";
pub const HTTPD_SECTION: &str = "httpd";
pub const CREDENTIALS_SECTION: &str = "credentials";

pub const ADMIN_USER: &str = "admin";
pub const REPLICATION_USER: &str = "replication";

fn httpd_entries(couch: &CouchConfig) -> Vec<Entry> {
    vec![
        Entry::new(HTTPD_SECTION, "bind_address", &couch.bind_address),
        Entry::new(HTTPD_SECTION, "port", couch.port),
    ]
}

/// Listener settings written at install time, while still in admin party.
pub fn base_documents(couch: &CouchConfig) -> Vec<DocumentTarget> {
    vec![
        DocumentTarget::new(LOCAL_DOCUMENT, httpd_entries(couch)),
        DocumentTarget::new(
            DEFAULT_DOCUMENT,
            vec![Entry::new(HTTPD_SECTION, "bind_address", &couch.bind_address)],
        ),
    ]
}

/// Documents that end admin party: server admins, mandatory auth, and the
/// listener settings.
pub fn secured_documents(bundle: &SecretBundle, couch: &CouchConfig) -> Vec<DocumentTarget> {
    let mut local = vec![
        Entry::new(ADMINS_SECTION, ADMIN_USER, &bundle.admin_pass),
        Entry::new(ADMINS_SECTION, REPLICATION_USER, &bundle.repl_pass),
        Entry::new(AUTH_SECTION, "require_valid_user", true),
    ];
    local.extend(httpd_entries(couch));

    let mut documents = vec![DocumentTarget::new(LOCAL_DOCUMENT, local)];
    if let Some(name) = &couch.credentials_document {
        documents.push(DocumentTarget::new(
            name.clone(),
            vec![
                Entry::new(CREDENTIALS_SECTION, "admin_pass", &bundle.admin_pass),
                Entry::new(CREDENTIALS_SECTION, "repl_pass", &bundle.repl_pass),
            ],
        ));
    }
    documents
}
