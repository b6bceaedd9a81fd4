//! Anti-detection material for the headless browser: launch flags, the script
//! injected before any page script runs, and challenge-page markers.

/// Chrome flags applied at launch. `--no-sandbox` is set through
/// `LaunchOptions::sandbox` instead.
pub const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--disable-infobars",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
    "--no-first-run",
    "--lang=en-US",
    "--window-position=0,0",
];

/// Patches the automation fingerprints Google is known to probe.
pub const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 4 });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai' },
            { name: 'Native Client', filename: 'internal-nacl-plugin' },
        ],
    });

    const originalToDataURL = HTMLCanvasElement.prototype.toDataURL;
    HTMLCanvasElement.prototype.toDataURL = function(...args) {
        if (this.width > 0 && this.height > 0) {
            const context = this.getContext('2d');
            if (context) {
                const imageData = context.getImageData(0, 0, this.width, this.height);
                if (imageData.data.length > 3) {
                    imageData.data[3] = Math.max(0, Math.min(255, imageData.data[3] + (Math.random() > 0.5 ? 1 : -1)));
                    context.putImageData(imageData, 0, 0);
                }
            }
        }
        return originalToDataURL.apply(this, args);
    };

    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) return 'Intel Inc.';
        if (parameter === 37446) return 'Intel Iris OpenGL Engine';
        return getParameter.apply(this, [parameter]);
    };

    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };

    const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
    if (originalQuery) {
        window.navigator.permissions.query = (parameters) =>
            parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : originalQuery(parameters);
    }

    ['RTCPeerConnection', 'webkitRTCPeerConnection', 'mozRTCPeerConnection', 'msRTCPeerConnection'].forEach(className => {
        if (window[className]) window[className] = undefined;
    });
"#;

/// Text seen on Google's "unusual traffic" interstitials and consent walls.
const CHALLENGE_MARKERS: &[&str] = &[
    "unusual traffic",
    "automated queries",
    "not a robot",
    "recaptcha",
    "/sorry/index",
    "before you continue",
];

/// First challenge marker found in a page, if any.
pub fn challenge_marker(html: &str) -> Option<&'static str> {
    let lowered = html.to_lowercase();
    CHALLENGE_MARKERS.iter().copied().find(|m| lowered.contains(m))
}

/// Reported accuracy, in metres, of a pinned position.
pub const GEOLOCATION_ACCURACY_M: f64 = 25.0;

/// Script pinning `navigator.geolocation` to fixed coordinates.
pub fn geolocation_script(lat: f64, lng: f64) -> String {
    format!(
        r#"
        (() => {{
            const position = {{
                coords: {{
                    latitude: {lat}, longitude: {lng}, accuracy: {accuracy},
                    altitude: null, altitudeAccuracy: null, heading: null, speed: null
                }},
                timestamp: Date.now()
            }};
            const geolocation = {{
                getCurrentPosition: (success) => success(position),
                watchPosition: (success) => {{ success(position); return 1; }},
                clearWatch: () => {{}}
            }};
            Object.defineProperty(navigator, 'geolocation', {{ get: () => geolocation }});
        }})();
        "#,
        lat = lat,
        lng = lng,
        accuracy = GEOLOCATION_ACCURACY_M
    )
}
