use crate::error::ParseError;
use crate::models::{DetailFields, IndexPage, RawListing};
use crate::scraper::cleaner::{find_iso_date, parse_count, parse_date, parse_queue_info};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

// ── Page layout ───────────────────────────────────────────────────────────────

pub const LIST_CONTAINER: &str = "#apartmentList";
const LIST_ENTRY: &str = ".appartment";
const ENTRY_TITLE: &str = ".apt-title a";
const ENTRY_ADDRESS: &str = ".apt-address";
const DETAIL_HEADERS: &str = ".apt-details-headers li";
const DETAIL_DATA: &str = ".apt-details-data li";
const NEXT_LINKS: &[&str] = &[
    "a[rel=\"next\"]",
    "link[rel=\"next\"]",
    ".pagination a.next",
    "a.next",
];
const DETAIL_CONTAINER: &str = "#SubNavigationContentContainer";
const LOGIN_FORM: &str = "form#loginform";
const MEMBER_CREDIT_DAYS: &str = "div[data-widget=\"koerochprenumerationer@STD\"] strong";

fn sel(s: &str) -> Result<Selector, ParseError> {
    Selector::parse(s).map_err(|e| ParseError::Selector(format!("{}: {:?}", s, e)))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

// ── Index page ────────────────────────────────────────────────────────────────

/// Which listing field a label ("Rent:", "Hyra", ...) names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Area,
    Address,
    Type,
    Floor,
    LivingSpace,
    Rent,
    MoveIn,
    Queue,
}

fn column_for(label: &str) -> Option<Column> {
    let l = label.trim().trim_end_matches(':').to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| l.contains(k));

    if has(&["address", "adress"]) {
        Some(Column::Address)
    } else if has(&["living", "size", "yta", "storlek", "boarea"]) {
        Some(Column::LivingSpace)
    } else if has(&["area", "område"]) {
        Some(Column::Area)
    } else if has(&["type", "typ"]) {
        Some(Column::Type)
    } else if has(&["floor", "våning"]) {
        Some(Column::Floor)
    } else if has(&["rent", "hyra"]) {
        Some(Column::Rent)
    } else if has(&["moving", "move", "inflytt", "tillträde"]) {
        Some(Column::MoveIn)
    } else if has(&["queue", "credit", "days", "köpoäng", "dagar", "bid"]) {
        Some(Column::Queue)
    } else {
        None
    }
}

/// Column order of the portal's list view when no header row is rendered.
const POSITIONAL: [Column; 8] = [
    Column::Area,
    Column::Address,
    Column::Type,
    Column::Floor,
    Column::LivingSpace,
    Column::Rent,
    Column::MoveIn,
    Column::Queue,
];

fn assign(raw: &mut RawListing, column: Column, value: String) {
    let slot = match column {
        Column::Area => &mut raw.area,
        Column::Address => &mut raw.address,
        Column::Type => &mut raw.housing_type,
        Column::Floor => &mut raw.floor,
        Column::LivingSpace => &mut raw.living_space,
        Column::Rent => &mut raw.rent,
        Column::MoveIn => &mut raw.move_in_date,
        Column::Queue => &mut raw.queue_info,
    };
    if slot.is_none() {
        *slot = non_empty(value);
    }
}

/// Parse one page of the listing index.
///
/// Every entry in the list container yields one `RawListing`, in document
/// order, whatever fields it is missing. Only a missing container is an error.
pub fn parse_index(html: &str, page_url: &Url) -> Result<IndexPage, ParseError> {
    let doc = Html::parse_document(html);

    let container_sel = sel(LIST_CONTAINER)?;
    let entry_sel = sel(LIST_ENTRY)?;
    let title_sel = sel(ENTRY_TITLE)?;
    let address_sel = sel(ENTRY_ADDRESS)?;
    let header_sel = sel(DETAIL_HEADERS)?;
    let data_sel = sel(DETAIL_DATA)?;

    let container = doc
        .select(&container_sel)
        .next()
        .ok_or(ParseError::MissingContainer(LIST_CONTAINER))?;

    let mut listings = Vec::new();

    for entry in container.select(&entry_sel) {
        let mut raw = RawListing::default();

        if let Some(a) = entry.select(&title_sel).next() {
            raw.name = non_empty(element_text(a));
            raw.link = a
                .value()
                .attr("href")
                .and_then(|href| page_url.join(href.trim()).ok())
                .map(|u| u.to_string());
        }
        raw.address = entry.select(&address_sel).next().map(element_text).and_then(non_empty);

        let headers: Vec<String> = entry.select(&header_sel).map(element_text).collect();
        let mut data: Vec<String> = entry.select(&data_sel).map(element_text).collect();

        // The list view pads the data row with empty cells.
        if data.len() > headers.len() {
            data.retain(|d| !d.is_empty());
        }

        if headers.is_empty() {
            for (column, value) in POSITIONAL.iter().zip(data) {
                assign(&mut raw, *column, value);
            }
        } else {
            for (label, value) in headers.iter().zip(data) {
                match column_for(label) {
                    Some(column) => assign(&mut raw, column, value),
                    None => debug!("ignoring unknown list column {:?}", label),
                }
            }
        }

        listings.push(raw);
    }

    let next_page = next_page_url(&doc, page_url)?;
    debug!("index page {}: {} entries, next={:?}", page_url, listings.len(), next_page);

    Ok(IndexPage { listings, next_page })
}

/// Resolve the "next page" link, if the page has one that leads elsewhere.
fn next_page_url(doc: &Html, page_url: &Url) -> Result<Option<String>, ParseError> {
    for selector in NEXT_LINKS {
        let s = sel(selector)?;
        let href = doc
            .select(&s)
            .filter_map(|el| el.value().attr("href"))
            .map(str::trim)
            .find(|h| !h.is_empty() && *h != "#");

        if let Some(href) = href {
            return Ok(page_url
                .join(href)
                .ok()
                .filter(|next| next != page_url)
                .map(|u| u.to_string()));
        }
    }
    Ok(None)
}

// ── Detail page ───────────────────────────────────────────────────────────────

const DEADLINE_KEYS: &[&str] = &[
    "application deadline",
    "closing date",
    "ansökan senast",
    "sista ansökningsdag",
    "sista dag",
];

enum DetailLabel {
    Deadline,
    Applicants,
    Queue,
}

fn detail_label(label: &str) -> Option<DetailLabel> {
    let l = label.trim().trim_end_matches(':').to_lowercase();
    if DEADLINE_KEYS.iter().any(|k| l.contains(k)) || l.contains("deadline") {
        Some(DetailLabel::Deadline)
    } else if l.contains("applicant") || l.contains("sökande") || l.contains("intresseanmälningar") {
        Some(DetailLabel::Applicants)
    } else if ["queue", "credit", "köpoäng", "bid", "dagar"].iter().any(|k| l.contains(k)) {
        Some(DetailLabel::Queue)
    } else {
        None
    }
}

/// Parse a listing's detail page. Each field is optional; only a page that is
/// not a listing at all (login form, error page) is an error.
pub fn parse_detail(html: &str) -> Result<DetailFields, ParseError> {
    let doc = Html::parse_document(html);

    if doc.select(&sel(LOGIN_FORM)?).next().is_some() {
        return Err(ParseError::NotAListing("login form instead of listing".into()));
    }
    let container = doc
        .select(&sel(DETAIL_CONTAINER)?)
        .next()
        .ok_or_else(|| ParseError::NotAListing(format!("no {} element", DETAIL_CONTAINER)))?;

    let mut pairs: Vec<(String, String)> = Vec::new();

    let dt_sel = sel("dt")?;
    let dd_sel = sel("dd")?;
    let dts = container.select(&dt_sel).map(element_text);
    let dds = container.select(&dd_sel).map(element_text);
    pairs.extend(dts.zip(dds));

    let header_sel = sel(DETAIL_HEADERS)?;
    let data_sel = sel(DETAIL_DATA)?;
    let headers = container.select(&header_sel).map(element_text);
    let data = container
        .select(&data_sel)
        .map(element_text)
        .filter(|d| !d.is_empty());
    pairs.extend(headers.zip(data));

    let mut fields = DetailFields::default();

    for (label, value) in &pairs {
        match detail_label(label) {
            Some(DetailLabel::Deadline) if fields.closing_date.is_none() => {
                fields.closing_date = parse_date(value);
            }
            Some(DetailLabel::Applicants) if fields.applicant_count.is_none() => {
                fields.applicant_count = parse_count(value);
            }
            Some(DetailLabel::Queue) if fields.best_bid_days.is_none() => {
                let (bid, applicants) = parse_queue_info(value);
                fields.best_bid_days = bid;
                if fields.applicant_count.is_none() {
                    fields.applicant_count = applicants;
                }
            }
            _ => {}
        }
    }

    // Free-text fallback: "Application deadline 2024-01-15 at 12:00"
    if fields.closing_date.is_none() {
        let text_sel = sel("div, p, span, li, strong")?;
        fields.closing_date = container
            .select(&text_sel)
            .map(element_text)
            .filter(|t| {
                let t = t.to_lowercase();
                DEADLINE_KEYS.iter().any(|k| t.contains(k))
            })
            .find_map(|t| find_iso_date(&t));
    }

    if fields == DetailFields::default() {
        warn!("detail page parsed but carried no closing date, applicants or best bid");
    }

    Ok(fields)
}

// ── Account & login pages ─────────────────────────────────────────────────────

/// The member's own queue days from the account page widget.
pub fn parse_member_credit_days(html: &str) -> Option<u32> {
    let doc = Html::parse_document(html);
    let s = sel(MEMBER_CREDIT_DAYS).ok()?;
    doc.select(&s).next().map(element_text).and_then(|t| parse_count(&t))
}

pub fn is_login_page(html: &str) -> bool {
    let doc = Html::parse_document(html);
    sel(LOGIN_FORM)
        .map(|s| doc.select(&s).next().is_some())
        .unwrap_or(false)
}

/// Login form target plus the hidden inputs that must be posted back.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginForm {
    pub action: Url,
    pub hidden: Vec<(String, String)>,
}

pub fn parse_login_form(html: &str, page_url: &Url) -> Result<LoginForm, ParseError> {
    let doc = Html::parse_document(html);
    let form = doc
        .select(&sel(LOGIN_FORM)?)
        .next()
        .ok_or(ParseError::MissingContainer(LOGIN_FORM))?;

    let action = form
        .value()
        .attr("action")
        .and_then(|a| page_url.join(a).ok())
        .unwrap_or_else(|| page_url.clone());

    let hidden = form
        .select(&sel("input[type=\"hidden\"]")?)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            Some((name.to_string(), input.value().attr("value").unwrap_or_default().to_string()))
        })
        .collect();

    Ok(LoginForm { action, hidden })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn entry(title: &str, href: &str, address: &str, kind: &str, rent: &str, queue: &str) -> String {
        format!(
            r#"<div class="appartment row">
                 <h3 class="apt-title"><a href="{href}">{title}</a></h3>
                 <p class="apt-address">{address}</p>
                 <ul class="apt-details-headers">
                   <li>Area:</li><li>Type:</li><li>Floor:</li><li>Living space:</li>
                   <li>Rent:</li><li>Moving in:</li><li>Queue days:</li>
                 </ul>
                 <ul class="apt-details-data">
                   <li>Lappkärrsberget</li><li></li><li>{kind}</li><li>2</li><li>25 m²</li>
                   <li>{rent}</li><li>2024-04-01</li><li>{queue}</li>
                 </ul>
               </div>"#
        )
    }

    pub(crate) fn index_html(entries: &[String], next: Option<&str>) -> String {
        let pager = next
            .map(|n| format!(r#"<nav class="pagination"><a class="next" href="{n}">Next</a></nav>"#))
            .unwrap_or_default();
        format!(
            r#"<html><body><div id="SubNavigationContentContainer">
                 <div id="apartmentList">{}</div>{}
               </div></body></html>"#,
            entries.concat(),
            pager
        )
    }

    fn base() -> Url {
        Url::parse("https://sssb.se/soka-bostad/lediga-bostader/").unwrap()
    }

    #[test]
    fn index_yields_one_record_per_entry_in_order() {
        let entries: Vec<String> = (1..=5)
            .map(|i| {
                entry(
                    &format!("Unit {}", i),
                    &format!("/objekt/{}", i),
                    &format!("Street {}", i),
                    "Apartment",
                    "4 500 kr",
                    "100 (2 st)",
                )
            })
            .collect();
        let page = parse_index(&index_html(&entries, None), &base()).unwrap();

        assert_eq!(page.listings.len(), 5);
        let names: Vec<_> = page.listings.iter().map(|l| l.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["Unit 1", "Unit 2", "Unit 3", "Unit 4", "Unit 5"]);
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn index_maps_labelled_columns() {
        let html = index_html(
            &[entry("Unit A", "/objekt/a", "Körsbärsvägen 4", "Apartment", "4 500 kr", "812 (14 st)")],
            None,
        );
        let page = parse_index(&html, &base()).unwrap();
        let raw = &page.listings[0];

        assert_eq!(raw.area.as_deref(), Some("Lappkärrsberget"));
        assert_eq!(raw.address.as_deref(), Some("Körsbärsvägen 4"));
        assert_eq!(raw.housing_type.as_deref(), Some("Apartment"));
        assert_eq!(raw.floor.as_deref(), Some("2"));
        assert_eq!(raw.living_space.as_deref(), Some("25 m²"));
        assert_eq!(raw.rent.as_deref(), Some("4 500 kr"));
        assert_eq!(raw.move_in_date.as_deref(), Some("2024-04-01"));
        assert_eq!(raw.queue_info.as_deref(), Some("812 (14 st)"));
        assert_eq!(raw.link.as_deref(), Some("https://sssb.se/objekt/a"));
    }

    #[test]
    fn index_tolerates_missing_fields() {
        let html = index_html(
            &[r#"<div class="appartment row"><p class="apt-address">Street 9</p></div>"#.to_string()],
            None,
        );
        let page = parse_index(&html, &base()).unwrap();
        assert_eq!(page.listings.len(), 1);
        assert_eq!(page.listings[0].address.as_deref(), Some("Street 9"));
        assert_eq!(page.listings[0].rent, None);
        assert_eq!(page.listings[0].link, None);
    }

    #[test]
    fn index_without_headers_reads_columns_by_position() {
        let html = index_html(
            &[r#"<div class="appartment row">
                   <ul class="apt-details-data">
                     <li>Strix</li><li>Street 5</li><li>Room</li><li>1</li>
                     <li>18 m²</li><li>3 900 kr</li><li>2024-05-01</li><li>55 (3 st)</li>
                   </ul>
                 </div>"#
                .to_string()],
            None,
        );
        let raw = &parse_index(&html, &base()).unwrap().listings[0];
        assert_eq!(raw.area.as_deref(), Some("Strix"));
        assert_eq!(raw.address.as_deref(), Some("Street 5"));
        assert_eq!(raw.housing_type.as_deref(), Some("Room"));
        assert_eq!(raw.queue_info.as_deref(), Some("55 (3 st)"));
    }

    #[test]
    fn missing_container_is_a_layout_error() {
        let err = parse_index("<html><body><p>Maintenance</p></body></html>", &base()).unwrap_err();
        assert_eq!(err, ParseError::MissingContainer(LIST_CONTAINER));
    }

    #[test]
    fn empty_container_is_an_empty_page() {
        let page = parse_index(&index_html(&[], None), &base()).unwrap();
        assert!(page.listings.is_empty());
    }

    #[test]
    fn next_link_is_resolved_against_the_page() {
        let page = parse_index(&index_html(&[], Some("?page=2")), &base()).unwrap();
        assert_eq!(
            page.next_page.as_deref(),
            Some("https://sssb.se/soka-bostad/lediga-bostader/?page=2")
        );
    }

    #[test]
    fn next_link_to_the_same_page_is_ignored() {
        let page = parse_index(&index_html(&[], Some("")), &base()).unwrap();
        assert_eq!(page.next_page, None);
        let page = parse_index(&index_html(&[], Some(base().as_str())), &base()).unwrap();
        assert_eq!(page.next_page, None);
    }

    pub(crate) fn detail_html(deadline: &str, applicants: &str, queue: &str) -> String {
        format!(
            r#"<html><body><div id="SubNavigationContentContainer">
                 <h1>Unit A</h1>
                 <dl>
                   <dt>Number of applicants</dt><dd>{applicants}</dd>
                   <dt>Best queue days</dt><dd>{queue}</dd>
                 </dl>
                 <div class="deadline">Application deadline: {deadline} at 12:00</div>
               </div></body></html>"#
        )
    }

    #[test]
    fn detail_page_fields() {
        let fields = parse_detail(&detail_html("2024-03-15", "14", "812")).unwrap();
        assert_eq!(fields.closing_date, NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(fields.applicant_count, Some(14));
        assert_eq!(fields.best_bid_days, Some(812));
    }

    #[test]
    fn detail_page_with_no_data_is_not_an_error() {
        let html = r#"<div id="SubNavigationContentContainer"><h1>Unit A</h1></div>"#;
        assert_eq!(parse_detail(html).unwrap(), DetailFields::default());
    }

    #[test]
    fn error_or_login_page_is_not_a_listing() {
        assert!(matches!(
            parse_detail("<html><body><h1>404</h1></body></html>"),
            Err(ParseError::NotAListing(_))
        ));
        let login = r#"<div id="SubNavigationContentContainer"><form id="loginform"></form></div>"#;
        assert!(matches!(parse_detail(login), Err(ParseError::NotAListing(_))));
    }

    #[test]
    fn member_credit_days_from_account_widget() {
        let html = r#"<div data-widget="koerochprenumerationer@STD"><p>Bostadskö</p><strong>1 024</strong></div>"#;
        assert_eq!(parse_member_credit_days(html), Some(1024));
        assert_eq!(parse_member_credit_days("<p>nothing</p>"), None);
    }

    #[test]
    fn login_form_action_and_hidden_inputs() {
        let html = r#"<form id="loginform" action="/wp-login.php" method="post">
                        <input name="log"><input type="password" name="pwd">
                        <input type="hidden" name="redirect_to" value="/mina-sidor/">
                      </form>"#;
        let form = parse_login_form(html, &base()).unwrap();
        assert_eq!(form.action.as_str(), "https://sssb.se/wp-login.php");
        assert_eq!(form.hidden, vec![("redirect_to".to_string(), "/mina-sidor/".to_string())]);
        assert!(is_login_page(html));
    }
}
