//! Annotations on the innermost open step
//!
//! Every helper is a no-op when no step is open on the calling thread.
//! Attachment helpers also need a sink registered on the context; sink errors
//! are logged and never reach the step body.

use std::path::Path;

use serde::Serialize;
use stepwise_common::{Attachment, Parameter, ParameterMode, Result};
use tracing::{trace, warn};

use crate::attachments::{AttachmentFactory, TEXT_PLAIN};
use crate::context::StepContext;
use crate::record::StepRef;

impl StepContext {
    /// Add a parameter to the current step
    pub fn add_parameter(&self, name: &str, value: impl ToString, mode: ParameterMode) {
        if let Some(step) = self.current_step_object() {
            step.lock().parameters.push(Parameter::new(name, value, mode));
        }
    }

    pub fn attach_text(&self, text: &str, name: &str) {
        self.attach_with(name, |factory| factory.text(text, name, TEXT_PLAIN));
    }

    pub fn attach_json<T>(&self, data: &T, name: &str)
    where
        T: Serialize + std::fmt::Debug + ?Sized,
    {
        self.attach_with(name, |factory| factory.json(data, name));
    }

    /// Attach a file from disk.
    ///
    /// A missing file adds a `file_error` parameter to the step instead.
    pub fn attach_file(&self, path: &Path, name: Option<&str>) {
        let Some(step) = self.current_step_object() else {
            return;
        };
        if !path.exists() {
            record_missing_file(&step, path);
            return;
        }
        let Some(factory) = self.attachments() else {
            trace!("No sink registered, skipping attachment");
            return;
        };
        match factory.file(path, name, None) {
            Ok(Some(attachment)) => step.lock().attachments.push(attachment),
            Ok(None) => record_missing_file(&step, path),
            Err(e) => warn!("Failed to attach file {}: {}", path.display(), e),
        }
    }

    pub fn attach_screenshot(&self, bytes: &[u8], name: &str) {
        self.attach_with(name, |factory| factory.screenshot(bytes, name));
    }

    /// Attach an HTML link; the URL doubles as the name when none is given
    pub fn add_link(&self, url: &str, name: Option<&str>) {
        self.attach_with(name.unwrap_or(url), |factory| factory.link(url, name));
    }

    fn annotation_target(&self) -> Option<(StepRef, AttachmentFactory)> {
        let step = self.current_step_object()?;
        match self.attachments() {
            Some(factory) => Some((step, factory)),
            None => {
                trace!("No sink registered, skipping attachment");
                None
            }
        }
    }

    fn attach_with(&self, name: &str, build: impl FnOnce(&AttachmentFactory) -> Result<Attachment>) {
        let Some((step, factory)) = self.annotation_target() else {
            return;
        };
        match build(&factory) {
            Ok(attachment) => step.lock().attachments.push(attachment),
            Err(e) => warn!("Failed to attach '{}': {}", name, e),
        }
    }
}

fn record_missing_file(step: &StepRef, path: &Path) {
    step.lock().parameters.push(Parameter::visible(
        "file_error",
        format!("File not found: {}", path.display()),
    ));
}

/// Add a parameter to the current step of the global context
pub fn add_step_parameter(name: &str, value: impl ToString, mode: ParameterMode) {
    StepContext::global().add_parameter(name, value, mode);
}

pub fn attach_text(text: &str, name: &str) {
    StepContext::global().attach_text(text, name);
}

pub fn attach_json<T>(data: &T, name: &str)
where
    T: Serialize + std::fmt::Debug + ?Sized,
{
    StepContext::global().attach_json(data, name);
}

pub fn attach_file(path: impl AsRef<Path>, name: Option<&str>) {
    StepContext::global().attach_file(path.as_ref(), name);
}

pub fn attach_screenshot(bytes: &[u8], name: &str) {
    StepContext::global().attach_screenshot(bytes, name);
}

pub fn add_link(url: &str, name: Option<&str>) {
    StepContext::global().add_link(url, name);
}
