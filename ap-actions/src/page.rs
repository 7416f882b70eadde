use crate::error::{ActionError, Result};
use ap_core::{Page, TargetStore};

/// Read-modify-write a target's page document under the store's per-target
/// lock. `edit` returns whether it changed anything; unchanged pages are not
/// rewritten.
pub(crate) fn edit_page(
    targets: &dyn TargetStore,
    target_id: &str,
    edit: impl FnOnce(&mut Page) -> bool,
) -> Result<bool> {
    let mut edit = Some(edit);
    let mut unreadable = None;
    let changed = targets.update(target_id, &mut |current: Option<&str>| {
        let mut page = match Page::parse(current.unwrap_or_default()) {
            Ok(page) => page,
            Err(e) => {
                unreadable = Some(e);
                return Ok(None);
            }
        };
        let Some(edit) = edit.take() else {
            return Ok(None);
        };
        if !edit(&mut page) {
            return Ok(None);
        }
        page.to_content().map(Some)
    })?;
    if let Some(e) = unreadable {
        return Err(ActionError::InvalidArguments(format!("target {target_id}: {e}")));
    }
    if !changed {
        tracing::debug!(target_id, "page already up to date");
    }
    Ok(changed)
}

pub(crate) fn same_text(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
