use axum::extract::State;
use maud::{DOCTYPE, Markup, PreEscaped, html};

use crate::server::AppState;

const XTERM_VERSION: &str = "5.5.0";
const FIT_ADDON_VERSION: &str = "0.10.0";

/// Browser terminal speaking the binary frame protocol
pub async fn index(State(state): State<AppState>) -> Markup {
    render(&state.config.path)
}

pub(crate) fn render(ws_path: &str) -> Markup {
    // JSON string literal is a valid JS string literal
    let path_literal = serde_json::to_string(ws_path).unwrap_or_else(|_| "\"/ws\"".to_string());
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "Terminal" }
                link rel="stylesheet"
                    href=(format!("https://cdn.jsdelivr.net/npm/@xterm/xterm@{XTERM_VERSION}/css/xterm.min.css"));
                style { (PreEscaped(STYLE)) }
            }
            body {
                div #terminal {}
                script src=(format!("https://cdn.jsdelivr.net/npm/@xterm/xterm@{XTERM_VERSION}/lib/xterm.min.js")) {}
                script src=(format!("https://cdn.jsdelivr.net/npm/@xterm/addon-fit@{FIT_ADDON_VERSION}/lib/addon-fit.min.js")) {}
                script { (PreEscaped(format!("const WS_PATH = {path_literal};\n{CLIENT_JS}"))) }
            }
        }
    }
}

const STYLE: &str = r#"
html, body { margin: 0; height: 100%; background: #000; }
#terminal { height: 100vh; width: 100vw; }
"#;

// Frame: first byte is the type ('0' connect, '1' key, '2' resize, '6' output,
// '7' exit, '8' heartbeat), the rest is the payload.
const CLIENT_JS: &str = r#"
(function () {
  const term = new Terminal({ cursorBlink: true });
  const fit = new FitAddon.FitAddon();
  term.loadAddon(fit);
  term.open(document.getElementById('terminal'));
  fit.fit();

  const encoder = new TextEncoder();
  const decoder = new TextDecoder();
  const scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
  const ws = new WebSocket(scheme + location.host + WS_PATH + location.search);
  ws.binaryType = 'arraybuffer';
  let connected = false;

  function send(type, payload) {
    if (ws.readyState !== WebSocket.OPEN) return;
    const body = typeof payload === 'string' ? encoder.encode(payload) : payload;
    const frame = new Uint8Array(body.length + 1);
    frame[0] = type.charCodeAt(0);
    frame.set(body, 1);
    ws.send(frame);
  }

  function sendResize() {
    send('2', JSON.stringify({ cols: term.cols, rows: term.rows }));
  }

  ws.onopen = function () { send('0', ''); };

  ws.onmessage = function (event) {
    const data = new Uint8Array(event.data);
    if (data.length === 0) return;
    const body = data.subarray(1);
    switch (String.fromCharCode(data[0])) {
      case '0':
        connected = true;
        sendResize();
        term.focus();
        break;
      case '6':
        term.write(body);
        break;
      case '7': {
        const exit = JSON.parse(decoder.decode(body));
        if (exit.message) term.write('\r\n' + exit.message + '\r\n');
        term.write('\r\n[process exited with code ' + exit.code + ']\r\n');
        break;
      }
      case '8':
        send('8', '');
        break;
    }
  };

  ws.onclose = function () {
    connected = false;
    term.write('\r\n[connection closed]\r\n');
  };

  term.onData(function (data) { if (connected) send('1', data); });
  term.onResize(function () { if (connected) sendResize(); });
  window.addEventListener('resize', function () { fit.fit(); });
})();
"#;
