//! JavaScript snippets evaluated in the portal page.
//!
//! All user-controlled strings are embedded as JSON literals.

use serde_json::Value;

fn lit(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Shared helper: first element matching `sel` that is rendered.
const VISIBLE_HELPER: &str = "const __visible = (sel) => Array.from(document.querySelectorAll(sel)).filter(el => el.getClientRects().length > 0);";

pub fn ready_state() -> String {
    "document.readyState".to_string()
}

pub fn location_href() -> String {
    "location.href".to_string()
}

pub fn exists(selector: &str) -> String {
    format!(
        "(() => {{ {} return __visible({}).length > 0; }})()",
        VISIBLE_HELPER,
        lit(selector)
    )
}

pub fn count(selector: &str) -> String {
    format!("document.querySelectorAll({}).length", lit(selector))
}

/// Focus and clear the first visible match. Returns false if there is none.
pub fn focus_and_clear(selector: &str) -> String {
    format!(
        concat!(
            "(() => {{ {} const el = __visible({})[0];",
            " if (!el) return false;",
            " el.scrollIntoView({{block: 'center'}}); el.focus();",
            " if ('value' in el) {{ el.value = ''; }} else {{ el.textContent = ''; }}",
            " return true; }})()"
        ),
        VISIBLE_HELPER,
        lit(selector)
    )
}

/// Focus the message box found by placeholder text, for portals whose markup
/// drifts away from the configured selector.
pub fn focus_by_placeholder(pattern: &str) -> String {
    format!(
        concat!(
            "(() => {{ const re = new RegExp({}, 'i');",
            " const el = Array.from(document.querySelectorAll('textarea, input, [contenteditable=\"true\"]'))",
            "   .find(e => re.test(e.getAttribute('placeholder') || e.getAttribute('data-placeholder') || '') && e.getClientRects().length > 0);",
            " if (!el) return false;",
            " el.focus(); if ('value' in el) {{ el.value = ''; }} else {{ el.textContent = ''; }}",
            " return true; }})()"
        ),
        lit(pattern)
    )
}

pub fn dispatch_input_event() -> String {
    "document.activeElement && document.activeElement.dispatchEvent(new Event('input', {bubbles: true}))"
        .to_string()
}

pub fn click(selector: &str) -> String {
    format!(
        concat!(
            "(() => {{ {} const el = __visible({})[0] || document.querySelector({});",
            " if (!el) return false;",
            " el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()"
        ),
        VISIBLE_HELPER,
        lit(selector),
        lit(selector)
    )
}

/// Click the `index`-th match in document order, visible or not.
pub fn click_nth(selector: &str, index: usize) -> String {
    format!(
        concat!(
            "(() => {{ const el = document.querySelectorAll({})[{}];",
            " if (!el) return false;",
            " el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()"
        ),
        lit(selector),
        index
    )
}

pub fn control_labels(selector: &str) -> String {
    format!(
        concat!(
            "(() => {{ {} return __visible({}).map(el =>",
            " ((el.innerText || el.value || el.getAttribute('aria-label') || '') + '').trim()); }})()"
        ),
        VISIBLE_HELPER,
        lit(selector)
    )
}

pub fn click_control(selector: &str, index: usize) -> String {
    format!(
        concat!(
            "(() => {{ {} const el = __visible({})[{}];",
            " if (!el) return false; el.click(); return true; }})()"
        ),
        VISIBLE_HELPER,
        lit(selector),
        index
    )
}

pub fn scroll_to_top(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (el) el.scrollTop = 0; return !!el; }})()",
        lit(selector)
    )
}

/// `[[role, text], ...]` for every message item, oldest first.
pub fn read_messages(item: &str, text: &str, buyer_class: &str, seller_class: &str) -> String {
    format!(
        concat!(
            "Array.from(document.querySelectorAll({item})).map(li => {{",
            " const cls = li.classList;",
            " const role = cls.contains({buyer}) ? 'buyer' : (cls.contains({seller}) ? 'seller' : 'system');",
            " const node = li.querySelector({text});",
            " const txt = ((node ? node.innerText : li.innerText) || '').trim();",
            " return txt ? [role, txt] : null;",
            "}}).filter(Boolean)"
        ),
        item = lit(item),
        text = lit(text),
        buyer = lit(buyer_class),
        seller = lit(seller_class),
    )
}

/// Best-effort scrape of the order side panel into
/// `{status, orderId, title, variation, sku, fields}`.
pub fn read_order_info() -> String {
    r#"(() => {
  const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const panels = Array.from(document.querySelectorAll('div,section,article'));
  const right = panels.find(el => /Buyer payment amount|Payment Time|Variation:|Varia[cç][aã]o:|SKU\s*:/i.test(el.textContent || '')) || document.body;

  const statusNode =
    right.querySelector('[class*="order_item_status_tags"] .el-tag, .el-tag') ||
    Array.from(right.querySelectorAll('span')).find(s => {
      const t = norm(s.textContent);
      return t && t.length <= 32 && /shipped|enviado|to ship|a caminho|entregue|ready to ship|to return|returned|cancelado|canceled/i.test(t);
    });
  const status = norm(statusNode && statusNode.textContent);

  const text = norm(right.textContent);
  const hashId = text.match(/#([A-Z0-9]{8,})\b/);
  const plainId = text.match(/\b[0-9A-Z]{10,}\b/);
  const orderId = (hashId && hashId[1]) || (plainId && plainId[0]) || '';

  const titleNode = right.querySelector('.product_name, [class*="product_name"], .line_clamp_2, a[title]');
  const title = titleNode ? norm(titleNode.textContent) : '';

  const raw = right.textContent || '';
  const v = raw.match(/(?:Variation|Varia[cç][aã]o)\s*:\s*([^\n]+)/i);
  const s = raw.match(/\bSKU\s*:\s*([A-Za-z0-9\-._]+)/i);

  const fields = {};
  right.querySelectorAll('*').forEach(el => {
    if (el.children.length > 2) return;
    const m = norm(el.textContent).match(/^([^:]{3,64}):\s*(.+)$/);
    if (m) fields[norm(m[1])] = norm(m[2]);
  });

  return { status, orderId, title, variation: norm(v && v[1]), sku: norm(s && s[1]), fields };
})()"#
        .to_string()
}

pub fn page_text() -> String {
    "document.body ? document.body.innerText : ''".to_string()
}

/// `{origin, entries}` for the current page's localStorage.
pub fn dump_local_storage() -> String {
    concat!(
        "(() => { const entries = {};",
        " try { for (let i = 0; i < localStorage.length; i++) {",
        "   const k = localStorage.key(i); entries[k] = localStorage.getItem(k); } } catch (e) {}",
        " return { origin: location.origin, entries }; })()"
    )
    .to_string()
}

/// Document-start script that seeds localStorage when the page origin matches.
pub fn restore_local_storage(origin: &str, entries: &serde_json::Map<String, Value>) -> String {
    format!(
        concat!(
            "(() => {{ if (location.origin !== {}) return;",
            " const entries = {};",
            " try {{ for (const [k, v] of Object.entries(entries)) {{",
            "   if (localStorage.getItem(k) === null) localStorage.setItem(k, v); }} }} catch (e) {{}} }})()"
        ),
        lit(origin),
        Value::Object(entries.clone())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_are_json_quoted() {
        let js = click("button[name='it\"s']");
        assert!(js.contains(r#""button[name='it\"s']""#));
    }

    #[test]
    fn test_read_messages_embeds_classes() {
        let js = read_messages("ul.message_main > li", "div.text_cont", "lt", "rt");
        assert!(js.contains(r#"cls.contains("lt")"#));
        assert!(js.contains(r#"cls.contains("rt")"#));
    }

    #[test]
    fn test_restore_local_storage_checks_origin() {
        let mut entries = serde_json::Map::new();
        entries.insert("token".into(), Value::String("abc".into()));
        let js = restore_local_storage("https://web.example.com", &entries);
        assert!(js.contains(r#"location.origin !== "https://web.example.com""#));
        assert!(js.contains(r#"{"token":"abc"}"#));
    }
}
