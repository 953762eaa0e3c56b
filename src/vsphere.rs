//! vSphere hypervisor adapter.
//!
//! Listeners consume the [`HypervisorClient`] trait; the production
//! implementation speaks the vSphere SOAP API (`/sdk`, `urn:vim25`).
//! Every operation runs inside a scoped session: login, operate, logout
//! on all exit paths. TLS certificate verification is disabled; the
//! fleet targets legacy vCenter installs with self-signed CAs.

use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::config::BmcConfig;
use crate::{Error, Result};

/// Power state of a virtual machine as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// The hypervisor operations the IPMI engine needs.
///
/// Implementations open one hypervisor session per call. Failures map to
/// IPMI completion codes at the dispatch layer.
pub trait HypervisorClient: Send {
    /// Resolve the managed VM to an opaque hypervisor identifier.
    fn lookup_vm(&self) -> Result<String>;
    fn get_power_state(&self) -> Result<PowerState>;
    fn power_on(&self) -> Result<()>;
    fn power_off(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn shutdown_guest(&self) -> Result<()>;
}

/// How the managed VM is located on the hypervisor: by UUID when the
/// config carries one, otherwise by unique name under the root folder.
#[derive(Debug, Clone)]
enum VmLookup {
    Uuid(String),
    Name(String),
}

/// SOAP client for a vCenter Server or standalone ESXi host.
pub struct VsphereClient {
    server: String,
    username: String,
    password: String,
    lookup: VmLookup,
    http: reqwest::blocking::Client,
}

/// Manager object references resolved from `RetrieveServiceContent`.
struct ServiceContent {
    session_manager: String,
    search_index: String,
    property_collector: String,
    root_folder: String,
    view_manager: String,
}

/// One logged-in SOAP session.
struct SoapSession {
    cookie: String,
    content: ServiceContent,
}

impl VsphereClient {
    /// Build a client from a BMC configuration. The VI server endpoint and
    /// credentials are required.
    pub fn from_config(config: &BmcConfig) -> Result<Self> {
        let server = config
            .viserver
            .clone()
            .ok_or_else(|| Error::Config(format!("no viserver configured for {}", config.vm_name)))?;
        let lookup = match &config.vm_uuid {
            Some(uuid) => VmLookup::Uuid(uuid.clone()),
            None => VmLookup::Name(config.vm_name.clone()),
        };
        let http = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::HypervisorConnect {
                server: server.clone(),
                message: e.to_string(),
            })?;
        Ok(VsphereClient {
            server,
            username: config.viserver_username.clone().unwrap_or_default(),
            password: config.viserver_password.clone().unwrap_or_default(),
            lookup,
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("https://{}/sdk", self.server)
    }

    fn connect_err(&self, message: impl Into<String>) -> Error {
        Error::HypervisorConnect {
            server: self.server.clone(),
            message: message.into(),
        }
    }

    /// POST one SOAP body and return the response text. Faults surface as
    /// [`Error::HypervisorOp`] with the fault string.
    fn soap_post(&self, cookie: Option<&str>, body: &str) -> Result<String> {
        let mut request = self
            .http
            .post(self.endpoint())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/6.7")
            .body(envelope(body));
        if let Some(cookie) = cookie {
            request = request.header("Cookie", cookie.to_string());
        }
        let response = request.send().map_err(|e| self.connect_err(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| self.connect_err(e.to_string()))?;
        if !status.is_success() {
            let fault = first_tag_text(&text, "faultstring")
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(Error::HypervisorOp(fault));
        }
        Ok(text)
    }

    fn login(&self) -> Result<SoapSession> {
        let text = self.soap_post(
            None,
            r#"<vim25:RetrieveServiceContent><vim25:_this type="ServiceInstance">ServiceInstance</vim25:_this></vim25:RetrieveServiceContent>"#,
        )?;
        let content = ServiceContent {
            session_manager: require_tag(&text, "sessionManager")?,
            search_index: require_tag(&text, "searchIndex")?,
            property_collector: require_tag(&text, "propertyCollector")?,
            root_folder: require_tag(&text, "rootFolder")?,
            view_manager: require_tag(&text, "viewManager")?,
        };

        let body = format!(
            r#"<vim25:Login><vim25:_this type="SessionManager">{}</vim25:_this><vim25:userName>{}</vim25:userName><vim25:password>{}</vim25:password></vim25:Login>"#,
            xml_escape(&content.session_manager),
            xml_escape(&self.username),
            xml_escape(&self.password),
        );
        let response = self
            .http
            .post(self.endpoint())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/6.7")
            .body(envelope(&body))
            .send()
            .map_err(|e| self.connect_err(e.to_string()))?;

        let cookie = response
            .headers()
            .get("set-cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::to_string);
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| self.connect_err(e.to_string()))?;
        if !status.is_success() {
            let fault = first_tag_text(&text, "faultstring")
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(self.connect_err(fault));
        }
        let cookie = cookie.ok_or_else(|| self.connect_err("login returned no session cookie"))?;
        Ok(SoapSession { cookie, content })
    }

    fn logout(&self, session: &SoapSession) -> Result<()> {
        let body = format!(
            r#"<vim25:Logout><vim25:_this type="SessionManager">{}</vim25:_this></vim25:Logout>"#,
            xml_escape(&session.content.session_manager),
        );
        self.soap_post(Some(&session.cookie), &body)?;
        Ok(())
    }

    /// Run `f` inside a scoped session, logging out on every exit path.
    fn with_session<T>(&self, f: impl FnOnce(&SoapSession) -> Result<T>) -> Result<T> {
        let session = self.login()?;
        let result = f(&session);
        if let Err(e) = self.logout(&session) {
            debug!("logout from {} failed: {}", self.server, e);
        }
        result
    }

    fn find_vm(&self, session: &SoapSession) -> Result<String> {
        match &self.lookup {
            VmLookup::Uuid(uuid) => {
                let body = format!(
                    r#"<vim25:FindByUuid><vim25:_this type="SearchIndex">{}</vim25:_this><vim25:uuid>{}</vim25:uuid><vim25:vmSearch>true</vim25:vmSearch></vim25:FindByUuid>"#,
                    xml_escape(&session.content.search_index),
                    xml_escape(uuid),
                );
                let text = self.soap_post(Some(&session.cookie), &body)?;
                first_tag_text(&text, "returnval")
                    .filter(|moref| !moref.is_empty())
                    .ok_or_else(|| Error::VmNotFoundByUuid(uuid.clone()))
            }
            VmLookup::Name(name) => {
                let matches: Vec<String> = self
                    .list_vm_names(session)?
                    .into_iter()
                    .filter(|(_, vm_name)| vm_name == name)
                    .map(|(moref, _)| moref)
                    .collect();
                if matches.len() != 1 {
                    return Err(Error::VmNotFound(name.clone()));
                }
                Ok(matches.into_iter().next().unwrap())
            }
        }
    }

    /// All `(moref, name)` pairs of VMs under the root folder, via a
    /// transient container view.
    fn list_vm_names(&self, session: &SoapSession) -> Result<Vec<(String, String)>> {
        let body = format!(
            r#"<vim25:CreateContainerView><vim25:_this type="ViewManager">{}</vim25:_this><vim25:container type="Folder">{}</vim25:container><vim25:type>VirtualMachine</vim25:type><vim25:recursive>true</vim25:recursive></vim25:CreateContainerView>"#,
            xml_escape(&session.content.view_manager),
            xml_escape(&session.content.root_folder),
        );
        let text = self.soap_post(Some(&session.cookie), &body)?;
        let view = first_tag_text(&text, "returnval")
            .ok_or_else(|| Error::HypervisorOp("CreateContainerView returned no view".into()))?;

        let result = self.retrieve_view_names(session, &view);

        let destroy = format!(
            r#"<vim25:DestroyView><vim25:_this type="ContainerView">{}</vim25:_this></vim25:DestroyView>"#,
            xml_escape(&view),
        );
        if let Err(e) = self.soap_post(Some(&session.cookie), &destroy) {
            debug!("DestroyView failed: {}", e);
        }
        result
    }

    fn retrieve_view_names(
        &self,
        session: &SoapSession,
        view: &str,
    ) -> Result<Vec<(String, String)>> {
        let body = format!(
            concat!(
                r#"<vim25:RetrievePropertiesEx><vim25:_this type="PropertyCollector">{pc}</vim25:_this>"#,
                r#"<vim25:specSet>"#,
                r#"<vim25:propSet><vim25:type>VirtualMachine</vim25:type><vim25:pathSet>name</vim25:pathSet></vim25:propSet>"#,
                r#"<vim25:objectSet><vim25:obj type="ContainerView">{view}</vim25:obj><vim25:skip>true</vim25:skip>"#,
                r#"<vim25:selectSet xsi:type="vim25:TraversalSpec"><vim25:name>view</vim25:name><vim25:type>ContainerView</vim25:type><vim25:path>view</vim25:path><vim25:skip>false</vim25:skip></vim25:selectSet>"#,
                r#"</vim25:objectSet></vim25:specSet><vim25:options/></vim25:RetrievePropertiesEx>"#,
            ),
            pc = xml_escape(&session.content.property_collector),
            view = xml_escape(view),
        );
        let mut text = self.soap_post(Some(&session.cookie), &body)?;
        let mut out = parse_object_values(&text);

        // Large inventories page through a continuation token.
        while let Some(token) = first_tag_text(&text, "token") {
            let body = format!(
                r#"<vim25:ContinueRetrievePropertiesEx><vim25:_this type="PropertyCollector">{}</vim25:_this><vim25:token>{}</vim25:token></vim25:ContinueRetrievePropertiesEx>"#,
                xml_escape(&session.content.property_collector),
                xml_escape(&token),
            );
            text = self.soap_post(Some(&session.cookie), &body)?;
            out.extend(parse_object_values(&text));
        }
        Ok(out)
    }

    fn vm_power_state(&self, session: &SoapSession, moref: &str) -> Result<PowerState> {
        let body = format!(
            concat!(
                r#"<vim25:RetrievePropertiesEx><vim25:_this type="PropertyCollector">{pc}</vim25:_this>"#,
                r#"<vim25:specSet>"#,
                r#"<vim25:propSet><vim25:type>VirtualMachine</vim25:type><vim25:pathSet>runtime.powerState</vim25:pathSet></vim25:propSet>"#,
                r#"<vim25:objectSet><vim25:obj type="VirtualMachine">{vm}</vim25:obj><vim25:skip>false</vim25:skip></vim25:objectSet>"#,
                r#"</vim25:specSet><vim25:options/></vim25:RetrievePropertiesEx>"#,
            ),
            pc = xml_escape(&session.content.property_collector),
            vm = xml_escape(moref),
        );
        let text = self.soap_post(Some(&session.cookie), &body)?;
        let state = parse_object_values(&text)
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| Error::HypervisorOp(format!("no power state for {}", moref)))?;
        match state.as_str() {
            "poweredOn" => Ok(PowerState::PoweredOn),
            "poweredOff" => Ok(PowerState::PoweredOff),
            "suspended" => Ok(PowerState::Suspended),
            other => Err(Error::HypervisorOp(format!("unknown power state {:?}", other))),
        }
    }

    /// Invoke a parameterless VM method (`PowerOnVM_Task` etc).
    fn vm_call(&self, session: &SoapSession, method: &str, moref: &str) -> Result<()> {
        let body = format!(
            r#"<vim25:{m}><vim25:_this type="VirtualMachine">{vm}</vim25:_this></vim25:{m}>"#,
            m = method,
            vm = xml_escape(moref),
        );
        self.soap_post(Some(&session.cookie), &body)?;
        Ok(())
    }
}

impl HypervisorClient for VsphereClient {
    fn lookup_vm(&self) -> Result<String> {
        self.with_session(|s| self.find_vm(s))
    }

    fn get_power_state(&self) -> Result<PowerState> {
        self.with_session(|s| {
            let vm = self.find_vm(s)?;
            self.vm_power_state(s, &vm)
        })
    }

    fn power_on(&self) -> Result<()> {
        self.with_session(|s| {
            let vm = self.find_vm(s)?;
            self.vm_call(s, "PowerOnVM_Task", &vm)
        })
    }

    fn power_off(&self) -> Result<()> {
        self.with_session(|s| {
            let vm = self.find_vm(s)?;
            self.vm_call(s, "PowerOffVM_Task", &vm)
        })
    }

    fn reset(&self) -> Result<()> {
        self.with_session(|s| {
            let vm = self.find_vm(s)?;
            self.vm_call(s, "ResetVM_Task", &vm)
        })
    }

    fn shutdown_guest(&self) -> Result<()> {
        self.with_session(|s| {
            let vm = self.find_vm(s)?;
            self.vm_call(s, "ShutdownGuest", &vm)
        })
    }
}

// ---------------------------------------------------------------------------
// SOAP plumbing
// ---------------------------------------------------------------------------

fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:vim25="urn:vim25">"#,
            r#"<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#,
        ),
        body
    )
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Text content of the first element with the given local name.
fn first_tag_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == tag.as_bytes() => inside = true,
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == tag.as_bytes() => return None,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn require_tag(xml: &str, tag: &str) -> Result<String> {
    first_tag_text(xml, tag)
        .ok_or_else(|| Error::HypervisorOp(format!("missing {} in service content", tag)))
}

/// Parse `RetrievePropertiesEx` results into `(moref, value)` pairs. Each
/// `<objects>` element holds an `<obj>` moref and one `<propSet>` with a
/// `<val>` text.
fn parse_object_values(xml: &str) -> Vec<(String, String)> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut out = Vec::new();
    let mut moref: Option<String> = None;
    let mut value: Option<String> = None;
    let mut capture: Option<&'static str> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"objects" => {
                    moref = None;
                    value = None;
                }
                b"obj" => capture = Some("obj"),
                b"val" => capture = Some("val"),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(target) = capture {
                    let text = t.unescape().map(|s| s.into_owned()).unwrap_or_default();
                    match target {
                        "obj" => moref = Some(text),
                        _ => value = Some(text),
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"obj" | b"val" => capture = None,
                b"objects" => {
                    if let (Some(m), Some(v)) = (moref.take(), value.take()) {
                        out.push((m, v));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_body() {
        let text = envelope("<vim25:Logout/>");
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("<soapenv:Body><vim25:Logout/></soapenv:Body>"));
    }

    #[test]
    fn escape_covers_reserved_characters() {
        assert_eq!(xml_escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn first_tag_text_handles_namespaces() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="x"><soapenv:Body><returnval type="ContainerView">session[1]-view</returnval></soapenv:Body></soapenv:Envelope>"#;
        assert_eq!(
            first_tag_text(xml, "returnval").as_deref(),
            Some("session[1]-view")
        );
        assert!(first_tag_text(xml, "missing").is_none());
    }

    #[test]
    fn parse_object_values_extracts_pairs() {
        let xml = concat!(
            r#"<returnval>"#,
            r#"<objects><obj type="VirtualMachine">vm-101</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">web-01</val></propSet></objects>"#,
            r#"<objects><obj type="VirtualMachine">vm-102</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">web-02</val></propSet></objects>"#,
            r#"</returnval>"#,
        );
        let pairs = parse_object_values(xml);
        assert_eq!(
            pairs,
            vec![
                ("vm-101".to_string(), "web-01".to_string()),
                ("vm-102".to_string(), "web-02".to_string()),
            ]
        );
    }

    #[test]
    fn parse_object_values_skips_empty_propsets() {
        let xml = r#"<returnval><objects><obj type="VirtualMachine">vm-1</obj></objects></returnval>"#;
        assert!(parse_object_values(xml).is_empty());
    }
}
