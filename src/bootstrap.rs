//! JavaScript that runs in the isolate before the loader.
//!
//! [`BOOTSTRAP_JS`] installs the browser-shaped globals the patched loader
//! calls into. [`driver_script`] starts the loader the way a page would.

/// Global the driver stores the loader's assembly exports under.
pub const EXPORTS_GLOBAL: &str = "__loaderExports";

/// Bootstrap JavaScript code that initializes the loader environment.
///
/// Runs once per isolate. `customImport` and `getDocument` are referenced by
/// name from patched loader source and must keep these names.
pub const BOOTSTRAP_JS: &str = r#"
const core = Deno.core;
const ops = core.ops;

const formatArg = (arg) => {
  if (arg === null) return 'null';
  if (arg === undefined) return 'undefined';
  if (typeof arg === 'object') {
    try {
      return JSON.stringify(arg);
    } catch (e) {
      return String(arg);
    }
  }
  return String(arg);
};

globalThis.console = {
  log: (...args) => ops.op_log(args.map(formatArg).join(' ')),
  error: (...args) => globalThis.console.log('[ERROR]', ...args),
  warn: (...args) => globalThis.console.log('[WARN]', ...args),
  info: (...args) => globalThis.console.log('[INFO]', ...args),
  debug: (...args) => globalThis.console.log('[DEBUG]', ...args),
  trace: (...args) => globalThis.console.log('[TRACE]', ...args),
};

const timeOrigin = ops.op_get_time_ms();
globalThis.performance = {
  timeOrigin,
  now: () => ops.op_get_time_ms() - timeOrigin,
};

// Timers sleep in Rust so the event loop stays free while they wait.
let timerId = 0;
const activeTimers = new Set();

const fire = (callback, args) => {
  if (typeof callback !== 'function') return;
  try {
    callback(...args);
  } catch (e) {
    globalThis.console.error(e && e.stack ? e.stack : String(e));
  }
};

globalThis.setTimeout = (callback, delay = 0, ...args) => {
  const id = ++timerId;
  activeTimers.add(id);
  ops.op_sleep(Number(delay) || 0).then(() => {
    if (activeTimers.delete(id)) fire(callback, args);
  });
  return id;
};

globalThis.setInterval = (callback, delay = 0, ...args) => {
  const id = ++timerId;
  activeTimers.add(id);
  const tick = () => ops.op_sleep(Number(delay) || 0).then(() => {
    if (!activeTimers.has(id)) return;
    fire(callback, args);
    tick();
  });
  tick();
  return id;
};

globalThis.clearTimeout = (id) => {
  activeTimers.delete(id);
};
globalThis.clearInterval = globalThis.clearTimeout;

globalThis.TextEncoder ??= class TextEncoder {
  get encoding() {
    return 'utf-8';
  }
  encode(input = '') {
    return core.encode(String(input));
  }
};

globalThis.TextDecoder ??= class TextDecoder {
  constructor(label = 'utf-8') {
    this.encoding = label;
  }
  decode(input) {
    if (input === undefined) return '';
    const view = input instanceof ArrayBuffer
      ? new Uint8Array(input)
      : new Uint8Array(input.buffer, input.byteOffset, input.byteLength);
    return core.decode(view);
  }
};

class URL {
  constructor(input, base) {
    Object.assign(this, ops.op_parse_url(String(input), base === undefined ? null : String(base)));
  }
  toString() {
    return this.href;
  }
  toJSON() {
    return this.href;
  }
}
globalThis.URL = URL;

class Headers {
  #map = new Map();
  constructor(init = []) {
    const entries = init instanceof Headers
      ? init.entries()
      : Array.isArray(init) ? init : Object.entries(init);
    for (const [name, value] of entries) this.set(name, value);
  }
  get(name) {
    return this.#map.get(String(name).toLowerCase()) ?? null;
  }
  has(name) {
    return this.#map.has(String(name).toLowerCase());
  }
  set(name, value) {
    this.#map.set(String(name).toLowerCase(), String(value));
  }
  entries() {
    return this.#map.entries();
  }
  forEach(callback) {
    this.#map.forEach((value, name) => callback(value, name, this));
  }
  [Symbol.iterator]() {
    return this.#map.entries();
  }
}
globalThis.Headers = Headers;

class Response {
  #text;
  #bytes;
  constructor(reply) {
    this.url = reply.url;
    this.status = reply.status;
    this.statusText = reply.statusText;
    this.ok = reply.status >= 200 && reply.status < 300;
    this.headers = new Headers(reply.headers);
    this.type = 'basic';
    this.#text = reply.text ?? null;
    this.#bytes = reply.bytes ?? null;
  }
  async text() {
    return this.#text ?? core.decode(this.#bytes);
  }
  async json() {
    return JSON.parse(await this.text());
  }
  async arrayBuffer() {
    const view = this.#bytes ?? core.encode(this.#text);
    return view.buffer.slice(view.byteOffset, view.byteOffset + view.byteLength);
  }
  clone() {
    return new Response({
      url: this.url,
      status: this.status,
      statusText: this.statusText,
      headers: [...this.headers.entries()],
      text: this.#text,
      bytes: this.#bytes,
    });
  }
}
globalThis.Response = Response;

if (typeof WebAssembly !== 'undefined') {
  WebAssembly.instantiateStreaming = async (source, imports) =>
    WebAssembly.instantiate(await (await source).arrayBuffer(), imports);
  WebAssembly.compileStreaming = async (source) =>
    WebAssembly.compile(await (await source).arrayBuffer());
}

const documentInfo = ops.op_document();
globalThis.getDocument = () => documentInfo;
globalThis.location = documentInfo.location;
globalThis.window = globalThis;
globalThis.self = globalThis;

const isRequestLike = (input) =>
  input !== null && typeof input === 'object' && !(input instanceof URL) && 'url' in input;

// Accepts a string, a URL or a request-like object; relative targets
// resolve against the document base like they would in a page.
const toUrl = (input) => {
  if (isRequestLike(input)) input = input.url;
  return new URL(String(input), documentInfo.baseURI).href;
};

const toBytes = (body) => {
  if (typeof body === 'string') return core.encode(body);
  if (body instanceof ArrayBuffer) return new Uint8Array(body);
  if (ArrayBuffer.isView(body)) {
    return new Uint8Array(body.buffer, body.byteOffset, body.byteLength);
  }
  return core.encode(String(body));
};

const NORMALIZED_METHODS = ['DELETE', 'GET', 'HEAD', 'OPTIONS', 'POST', 'PUT'];

// `init` wins over the fields of a request-like input, as in a page.
const toOptions = (input, init) => {
  const source = isRequestLike(input) ? input : {};
  init = init ?? {};
  const method = init.method ?? source.method;
  const headers = new Headers(init.headers ?? source.headers ?? []);
  const body = init.body ?? source.body;
  let normalized = null;
  if (method !== undefined && method !== null) {
    const upper = String(method).toUpperCase();
    normalized = NORMALIZED_METHODS.includes(upper) ? upper : String(method);
  }
  return {
    method: normalized,
    headers: [...headers.entries()],
    body: body === undefined || body === null ? null : Array.from(toBytes(body)),
  };
};

globalThis.fetch = async (input, init) =>
  new Response(await ops.op_fetch(toUrl(input), toOptions(input, init)));

// Modules fetched by the loader itself get their imports rerouted. The
// bootstrap module arrives already patched by the interceptor and is
// imported as served.
const importModule = async (url, rewrite) => {
  const href = toUrl(url);
  const response = await globalThis.fetch(href);
  if (!response.ok) {
    throw new Error(`Failed to import ${href}: ${response.status} ${response.statusText}`);
  }
  let text = await response.text();
  if (rewrite) text = ops.op_rewrite_imports(text);
  return await import(ops.op_register_module(href, text));
};

globalThis.customImport = (url) => importModule(url, true);

delete globalThis.Deno;
"#;

/// Start-up sequence for a loader whose bootstrap module lives at
/// `bootstrap_url`. Failures anywhere are reported through `op_report_error`.
pub fn driver_script(bootstrap_url: &str, boot_config_url: &str) -> String {
    let bootstrap_url = serde_json::Value::from(bootstrap_url);
    let boot_config_url = serde_json::Value::from(boot_config_url);
    format!(
        r#"
(async () => {{
  try {{
    const {{ dotnet }} = await importModule({bootstrap_url}, false);
    const {{ setModuleImports, getAssemblyExports, getConfig, runMain }} = await dotnet
      .withConfigSrc({boot_config_url})
      .withApplicationArguments("start")
      .create();
    setModuleImports("main.js", {{
      dom: {{
        setInnerText: (selector, text) => ops.op_set_inner_text(String(selector), String(text)),
      }},
    }});
    const config = getConfig();
    globalThis.{EXPORTS_GLOBAL} = await getAssemblyExports(config.mainAssemblyName);
    ops.op_exports_ready();
    await runMain();
  }} catch (e) {{
    console.error(e && e.stack ? e.stack : String(e));
    ops.op_report_error(e && e.message ? e.message : String(e));
  }}
}})();
"#
    )
}
