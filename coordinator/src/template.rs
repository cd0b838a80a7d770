// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering of marble parameters.
//!
//! Values in a marble's `Files`, `Env` and `Argv` may contain placeholders of
//! the form `{{ name }}`. The vocabulary is fixed:
//!
//! | placeholder        | replaced with                                 |
//! |--------------------|-----------------------------------------------|
//! | `root_ca`          | the coordinator root certificate, PEM         |
//! | `marble_cert`      | the marble's issued leaf certificate, PEM     |
//! | `marble_key`       | the marble's private key, PKCS#8 PEM          |
//! | `seal_key`         | the marble type's sealing key, hex            |
//! | `marble_type`      | the marble type name                          |
//! | `uuid`             | the marble instance id                        |
//! | `secret.<name>`    | a manifest secret (keys hex, plain verbatim)  |
//!
//! Everything here is pure: no I/O, no randomness.

use crate::manifest::ParameterTemplate;
use mesh_coordinator_api::Parameters;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder in {0:?}")]
    Unterminated(String),

    #[error("unknown placeholder {0:?}")]
    UnknownPlaceholder(String),

    #[error("placeholder references undefined secret {0:?}")]
    UndefinedSecret(String),

    #[error("secret {0:?} has not been set yet")]
    SecretNotSet(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder<'a> {
    RootCa,
    MarbleCert,
    MarbleKey,
    SealKey,
    MarbleType,
    Uuid,
    Secret(&'a str),
}

impl<'a> Placeholder<'a> {
    fn parse(name: &'a str) -> Result<Placeholder<'a>, TemplateError> {
        match name {
            "root_ca" => Ok(Placeholder::RootCa),
            "marble_cert" => Ok(Placeholder::MarbleCert),
            "marble_key" => Ok(Placeholder::MarbleKey),
            "seal_key" => Ok(Placeholder::SealKey),
            "marble_type" => Ok(Placeholder::MarbleType),
            "uuid" => Ok(Placeholder::Uuid),
            _ => match name.strip_prefix("secret.") {
                Some(secret) if !secret.is_empty() => {
                    Ok(Placeholder::Secret(secret))
                }
                _ => Err(TemplateError::UnknownPlaceholder(name.to_string())),
            },
        }
    }
}

/// One piece of a template string.
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(Placeholder<'a>),
}

fn segments(text: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            out.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(text.to_string()))?;
        out.push(Segment::Placeholder(Placeholder::parse(
            after[..end].trim(),
        )?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

fn template_values(
    template: &ParameterTemplate,
) -> impl Iterator<Item = &String> {
    template
        .files
        .values()
        .chain(template.env.values())
        .chain(template.argv.iter())
}

/// Check that every placeholder in `template` is known and that every secret
/// it references is defined.
pub fn validate(
    template: &ParameterTemplate,
    secret_names: &BTreeSet<&str>,
) -> Result<(), TemplateError> {
    for value in template_values(template) {
        for segment in segments(value)? {
            if let Segment::Placeholder(Placeholder::Secret(name)) = segment {
                if !secret_names.contains(name) {
                    return Err(TemplateError::UndefinedSecret(
                        name.to_string(),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Everything a placeholder can expand to for one activation.
pub struct TemplateContext<'a> {
    pub root_ca: &'a str,
    pub marble_cert: &'a str,
    pub marble_key: &'a str,
    pub seal_key: &'a str,
    pub marble_type: &'a str,
    pub uuid: &'a str,
    /// Secrets that currently have a value, already in their rendered form
    pub secrets: &'a BTreeMap<String, String>,
}

impl std::fmt::Debug for TemplateContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateContext")
            .field("marble_type", &self.marble_type)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

fn render_value(
    text: &str,
    ctx: &TemplateContext<'_>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Placeholder(p) => out.push_str(match p {
                Placeholder::RootCa => ctx.root_ca,
                Placeholder::MarbleCert => ctx.marble_cert,
                Placeholder::MarbleKey => ctx.marble_key,
                Placeholder::SealKey => ctx.seal_key,
                Placeholder::MarbleType => ctx.marble_type,
                Placeholder::Uuid => ctx.uuid,
                Placeholder::Secret(name) => {
                    ctx.secrets.get(name).map(String::as_str).ok_or_else(
                        || TemplateError::SecretNotSet(name.to_string()),
                    )?
                }
            }),
        }
    }
    Ok(out)
}

/// Render `template` for one activation.
pub fn render(
    template: &ParameterTemplate,
    ctx: &TemplateContext<'_>,
) -> Result<Parameters, TemplateError> {
    let files = template
        .files
        .iter()
        .map(|(path, value)| Ok((path.clone(), render_value(value, ctx)?)))
        .collect::<Result<_, TemplateError>>()?;
    let env = template
        .env
        .iter()
        .map(|(name, value)| Ok((name.clone(), render_value(value, ctx)?)))
        .collect::<Result<_, TemplateError>>()?;
    let argv = template
        .argv
        .iter()
        .map(|arg| render_value(arg, ctx))
        .collect::<Result<_, TemplateError>>()?;
    Ok(Parameters { files, env, argv })
}
