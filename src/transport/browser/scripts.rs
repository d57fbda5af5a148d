//! Page-side scripts.
//!
//! The interceptor wraps `window.WebSocket` so the page's own chat socket is
//! reachable from CDP and reports its traffic on the console:
//!
//! | Console marker | Arguments |
//! |----------------|-----------|
//! | `[WS_INTERCEPTOR_READY]` | none |
//! | `[WS_PRIMARY]` | url |
//! | `[WS_CREATED]` | url |
//! | `[WS_OPENED]` | url |
//! | `[WS_CREATED_IN_IFRAME]` | frame name, url |
//! | `[WS_MESSAGE_RECEIVED]` | frame text |
//! | `[WS_MESSAGE_SENT]` | frame text |
//! | `[CDP_SEND_ERROR]` | error (via `console.error`) |

use serde_json::Value;

use crate::error::Result;

const HOSTS_PLACEHOLDER: &str = "__TARGET_HOSTS__";
const PAYLOAD_PLACEHOLDER: &str = "__PAYLOAD__";

const INTERCEPTOR_TEMPLATE: &str = r"(function() {
    const wsSymbol = Symbol.for('_ws_');
    const wsArraySymbol = Symbol.for('_ws_array_');
    const injectedSymbol = Symbol.for('_inj_');
    const hosts = __TARGET_HOSTS__;

    if (window[injectedSymbol]) return;
    window[wsArraySymbol] = window[wsArraySymbol] || [];

    const NativeWebSocket = window.WebSocket;
    window.WebSocket = class extends NativeWebSocket {
        constructor(...args) {
            super(...args);
            const url = String(args[0] || '');
            if (!hosts.some((host) => url.includes(host))) return this;

            window[wsArraySymbol].push({ ws: this, url: url, createdAt: Date.now() });
            if (url.includes(hosts[0])) {
                window[wsSymbol] = this;
                window.__xianyuWebSocket = this;
                console.log('[WS_PRIMARY]', url);
            } else if (!window[wsSymbol]) {
                window[wsSymbol] = this;
                window.__xianyuWebSocket = this;
            }
            console.log('[WS_CREATED]', url);

            this.addEventListener('message', (event) => {
                console.log('[WS_MESSAGE_RECEIVED]', event.data);
            });
            const nativeSend = this.send;
            this.send = function(data) {
                console.log('[WS_MESSAGE_SENT]', data);
                return nativeSend.call(this, data);
            };
            this.addEventListener('open', () => console.log('[WS_OPENED]', url));
            return this;
        }
    };

    window[injectedSymbol] = true;
    window.__wsInterceptorInjected = true;
    console.log('[WS_INTERCEPTOR_READY]');
})();";

const IFRAME_TEMPLATE: &str = r"(function() {
    const hosts = __TARGET_HOSTS__;
    const iframes = document.querySelectorAll('iframe');
    let injectedCount = 0;

    for (let i = 0; i < iframes.length; i++) {
        try {
            const iframe = iframes[i];
            const frameWin = iframe.contentWindow;
            if (!frameWin || frameWin.__wsInterceptorInjected) continue;

            const name = iframe.name || iframe.id || `iframe_${i}`;
            const NativeWebSocket = frameWin.WebSocket;
            frameWin.WebSocket = function(...args) {
                const ws = new NativeWebSocket(...args);
                const url = String(args[0] || '');
                if (hosts.some((host) => url.includes(host))) {
                    frameWin[Symbol.for('_ws_')] = ws;
                    frameWin.__xianyuWebSocket = ws;
                    console.log('[WS_CREATED_IN_IFRAME]', name, url);
                    ws.addEventListener('message', (event) => {
                        console.log('[WS_MESSAGE_RECEIVED]', event.data);
                    });
                }
                return ws;
            };
            frameWin.WebSocket.prototype = NativeWebSocket.prototype;
            frameWin.__wsInterceptorInjected = true;
            injectedCount++;
        } catch (e) {
            // cross-origin
        }
    }
    return { iframeCount: iframes.length, injectedCount: injectedCount };
})();";

const PROBE_TEMPLATE: &str = r"(function() {
    const hosts = __TARGET_HOSTS__;
    const isTarget = (url) => typeof url === 'string' && hosts.some((host) => url.includes(host));

    function scan(win, frameName) {
        try {
            const injected = win.__xianyuWebSocket;
            if (injected && injected.readyState !== undefined) {
                return { found: true, url: injected.url, readyState: injected.readyState, method: 'injected', frameName: frameName };
            }
            try {
                for (const entry of win.performance.getEntriesByType('resource')) {
                    if (isTarget(entry.name)) {
                        return { found: true, url: entry.name, readyState: -1, method: 'performance', frameName: frameName };
                    }
                }
            } catch (e) {}
            for (const key in win) {
                try {
                    const candidate = win[key];
                    if (candidate instanceof win.WebSocket && isTarget(candidate.url)) {
                        return { found: true, url: candidate.url, readyState: candidate.readyState, method: 'window_scan', frameName: frameName };
                    }
                } catch (e) {}
            }
        } catch (e) {}
        return null;
    }

    const main = scan(window, 'main');
    if (main) return main;

    const iframes = document.querySelectorAll('iframe');
    for (let i = 0; i < iframes.length; i++) {
        try {
            const frameWin = iframes[i].contentWindow;
            if (!frameWin) continue;
            const hit = scan(frameWin, iframes[i].name || iframes[i].id || `iframe_${i}`);
            if (hit) return hit;
        } catch (e) {}
    }
    return { found: false };
})();";

const SEND_TEMPLATE: &str = r"(function() {
    try {
        const frames = [window];
        for (const iframe of document.querySelectorAll('iframe')) {
            try {
                if (iframe.contentWindow) frames.push(iframe.contentWindow);
            } catch (e) {}
        }
        let ws = null;
        for (const win of frames) {
            try {
                const candidate = win[Symbol.for('_ws_')] || win.__xianyuWebSocket;
                if (candidate && candidate.readyState === 1) {
                    ws = candidate;
                    break;
                }
                if (!ws && candidate) ws = candidate;
            } catch (e) {}
        }
        if (ws && ws.readyState === 1) {
            ws.send(__PAYLOAD__);
            return { success: true, message: 'sent_via_primary', url: ws.url };
        }
        return { success: false, message: ws ? 'readyState=' + ws.readyState : 'no instance' };
    } catch (e) {
        console.error('[CDP_SEND_ERROR]', String(e));
        return { success: false, message: String(e) };
    }
})();";

/// Renders the scripts for a set of target hosts.
///
/// The first host is the preferred socket when a page opens several.
#[derive(Debug, Clone)]
pub(crate) struct PageScripts {
    pub(crate) interceptor: String,
    pub(crate) iframe_injection: String,
    pub(crate) probe: String,
}

impl PageScripts {
    pub(crate) fn new(target_hosts: &[String]) -> Self {
        let hosts = Value::from(target_hosts.to_vec()).to_string();
        Self {
            interceptor: INTERCEPTOR_TEMPLATE.replace(HOSTS_PLACEHOLDER, &hosts),
            iframe_injection: IFRAME_TEMPLATE.replace(HOSTS_PLACEHOLDER, &hosts),
            probe: PROBE_TEMPLATE.replace(HOSTS_PLACEHOLDER, &hosts),
        }
    }
}

/// Builds the script that writes `frame` to the page's socket.
///
/// The frame is embedded as a JSON string literal.
pub(crate) fn send_script(frame: &Value) -> Result<String> {
    let literal = serde_json::to_string(&serde_json::to_string(frame)?)?;
    Ok(SEND_TEMPLATE.replace(PAYLOAD_PLACEHOLDER, &literal))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_hosts_are_embedded_in_order() {
        let scripts = PageScripts::new(&["a.example".to_string(), "b.example".to_string()]);
        for script in [&scripts.interceptor, &scripts.iframe_injection, &scripts.probe] {
            assert!(script.contains(r#"const hosts = ["a.example","b.example"];"#));
            assert!(!script.contains(HOSTS_PLACEHOLDER));
        }
    }

    #[test]
    fn test_send_script_escapes_payload() {
        let frame = json!({"text": "it's a \"quote\"\nline</script>"});
        let script = send_script(&frame).expect("script");
        assert!(!script.contains(PAYLOAD_PLACEHOLDER));

        let start = script.find("ws.send(").expect("send call") + "ws.send(".len();
        let end = script[start..].find(");").expect("call end") + start;
        let literal: String = serde_json::from_str(&script[start..end]).expect("string literal");
        let decoded: Value = serde_json::from_str(&literal).expect("frame json");
        assert_eq!(decoded, frame);
    }
}
